//! In-process store implementing the transport primitives.
//!
//! Behaves like a single Redis node for the command subset the protocol
//! uses: typed values (strings, sets, lists), lazy key expiry, and
//! `WATCH`/`MULTI`/`EXEC` where any write to a watched key aborts the
//! guarded transaction.
//!
//! Time comes from `tokio::time::Instant`, so tests can pause the clock and
//! advance it past entry and lock expiries.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regioncache_core::{RegionCacheResult, TransportError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::command::{Command, Reply, SetCondition};
use crate::transport::{StoreTransport, Transaction, WatchToken};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Data {
    Bytes(Vec<u8>),
    Set(BTreeSet<Vec<u8>>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct WatchState {
    keys: HashSet<String>,
    dirty: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, Entry>,
    watches: HashMap<Uuid, WatchState>,
}

impl StoreState {
    /// Mark every watch over `key` as dirty.
    fn touch(&mut self, key: &str) {
        for watch in self.watches.values_mut() {
            if watch.keys.contains(key) {
                watch.dirty = true;
            }
        }
    }

    /// Drop `key` if its deadline has passed.
    fn purge_expired(&mut self, key: &str, now: Instant) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|deadline| deadline <= now)
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
            self.touch(key);
        }
    }

    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        self.purge_expired(key, now);
        self.entries.get_mut(key)
    }

    fn apply(&mut self, command: &Command, now: Instant) -> Reply {
        match command {
            Command::Get { key } => match self.live(key, now) {
                None => Reply::Nil,
                Some(Entry {
                    data: Data::Bytes(bytes),
                    ..
                }) => Reply::Bulk(bytes.clone()),
                Some(_) => Reply::Error(WRONGTYPE.to_string()),
            },
            Command::MGet { keys } => Reply::Array(
                keys.iter()
                    .map(|key| match self.live(key, now) {
                        Some(Entry {
                            data: Data::Bytes(bytes),
                            ..
                        }) => Reply::Bulk(bytes.clone()),
                        _ => Reply::Nil,
                    })
                    .collect(),
            ),
            Command::Set {
                key,
                value,
                expiry,
                condition,
            } => {
                let exists = self.live(key, now).is_some();
                if *condition == SetCondition::IfAbsent && exists {
                    return Reply::Nil;
                }
                self.entries.insert(
                    key.clone(),
                    Entry {
                        data: Data::Bytes(value.clone()),
                        expires_at: expiry.map(|ttl| now + ttl),
                    },
                );
                self.touch(key);
                Reply::Ok
            }
            Command::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    self.purge_expired(key, now);
                    if self.entries.remove(key).is_some() {
                        removed += 1;
                        self.touch(key);
                    }
                }
                Reply::Int(removed)
            }
            Command::Incr { key } => {
                let current = match self.live(key, now) {
                    None => 0,
                    Some(Entry {
                        data: Data::Bytes(bytes),
                        ..
                    }) => match std::str::from_utf8(bytes).ok().and_then(|s| s.parse::<i64>().ok()) {
                        Some(n) => n,
                        None => {
                            return Reply::Error(
                                "ERR value is not an integer or out of range".to_string(),
                            )
                        }
                    },
                    Some(_) => return Reply::Error(WRONGTYPE.to_string()),
                };
                let next = match current.checked_add(1) {
                    Some(n) => n,
                    None => return Reply::Error("ERR increment would overflow".to_string()),
                };
                let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
                self.entries.insert(
                    key.clone(),
                    Entry {
                        data: Data::Bytes(next.to_string().into_bytes()),
                        expires_at,
                    },
                );
                self.touch(key);
                Reply::Int(next)
            }
            Command::Rename { from, to } => {
                self.purge_expired(from, now);
                match self.entries.remove(from) {
                    None => Reply::Error("ERR no such key".to_string()),
                    Some(entry) => {
                        self.entries.insert(to.clone(), entry);
                        self.touch(from);
                        self.touch(to);
                        Reply::Ok
                    }
                }
            }
            Command::Expire { key, ttl } => match self.live(key, now) {
                None => Reply::Int(0),
                Some(entry) => {
                    entry.expires_at = Some(now + *ttl);
                    self.touch(key);
                    Reply::Int(1)
                }
            },
            Command::SAdd { key, member } => {
                let entry = self.live(key, now);
                let added = match entry {
                    None => {
                        let mut set = BTreeSet::new();
                        set.insert(member.clone());
                        self.entries.insert(
                            key.clone(),
                            Entry {
                                data: Data::Set(set),
                                expires_at: None,
                            },
                        );
                        true
                    }
                    Some(Entry {
                        data: Data::Set(set),
                        ..
                    }) => set.insert(member.clone()),
                    Some(_) => return Reply::Error(WRONGTYPE.to_string()),
                };
                if added {
                    self.touch(key);
                }
                Reply::Int(i64::from(added))
            }
            Command::SRem { key, member } => {
                let (removed, now_empty) = match self.live(key, now) {
                    None => (false, false),
                    Some(Entry {
                        data: Data::Set(set),
                        ..
                    }) => (set.remove(member), set.is_empty()),
                    Some(_) => return Reply::Error(WRONGTYPE.to_string()),
                };
                if now_empty {
                    self.entries.remove(key);
                }
                if removed {
                    self.touch(key);
                }
                Reply::Int(i64::from(removed))
            }
            Command::SMembers { key } => match self.live(key, now) {
                None => Reply::Array(Vec::new()),
                Some(Entry {
                    data: Data::Set(set),
                    ..
                }) => Reply::Array(set.iter().cloned().map(Reply::Bulk).collect()),
                Some(_) => Reply::Error(WRONGTYPE.to_string()),
            },
            Command::LPush { key, value } => {
                let len = match self.live(key, now) {
                    None => {
                        let mut list = VecDeque::new();
                        list.push_front(value.clone());
                        self.entries.insert(
                            key.clone(),
                            Entry {
                                data: Data::List(list),
                                expires_at: None,
                            },
                        );
                        1
                    }
                    Some(Entry {
                        data: Data::List(list),
                        ..
                    }) => {
                        list.push_front(value.clone());
                        list.len()
                    }
                    Some(_) => return Reply::Error(WRONGTYPE.to_string()),
                };
                self.touch(key);
                Reply::Int(len as i64)
            }
            Command::LRange { key, start, stop } => match self.live(key, now) {
                None => Reply::Array(Vec::new()),
                Some(Entry {
                    data: Data::List(list),
                    ..
                }) => {
                    let len = list.len() as i64;
                    let start = if *start < 0 { (len + start).max(0) } else { *start };
                    let stop = if *stop < 0 { len + stop } else { (*stop).min(len - 1) };
                    if start > stop || start >= len {
                        Reply::Array(Vec::new())
                    } else {
                        Reply::Array(
                            list.iter()
                                .skip(start as usize)
                                .take((stop - start + 1) as usize)
                                .cloned()
                                .map(Reply::Bulk)
                                .collect(),
                        )
                    }
                }
                Some(_) => Reply::Error(WRONGTYPE.to_string()),
            },
        }
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    commands_seen: AtomicU64,
    unreachable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate a network partition: every call fails until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of commands that reached the store.
    pub fn command_count(&self) -> u64 {
        self.commands_seen.load(Ordering::SeqCst)
    }

    /// Live keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.map(|d| d > now).unwrap_or(true))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remaining time-to-live of a key, `None` when absent or persistent.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .and_then(|deadline| deadline.checked_duration_since(now))
    }

    /// Number of watches not yet consumed by exec or unwatch.
    pub async fn open_watches(&self) -> usize {
        self.state.lock().await.watches.len()
    }

    fn check_reachable(&self) -> RegionCacheResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable {
                reason: "in-memory store marked unreachable".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn count(&self, n: usize) {
        self.commands_seen.fetch_add(n as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreTransport for InMemoryStore {
    async fn execute(&self, command: Command) -> RegionCacheResult<Reply> {
        self.check_reachable()?;
        self.count(1);
        let reply = self.state.lock().await.apply(&command, Instant::now());
        match reply {
            Reply::Error(reason) => Err(TransportError::CommandFailed {
                command: command.name().to_string(),
                reason,
            }
            .into()),
            reply => Ok(reply),
        }
    }

    async fn pipeline(&self, commands: Vec<Command>) -> RegionCacheResult<Vec<Reply>> {
        self.check_reachable()?;
        self.count(commands.len());
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(commands.iter().map(|c| state.apply(c, now)).collect())
    }

    async fn watch(&self, keys: Vec<String>) -> RegionCacheResult<WatchToken> {
        self.check_reachable()?;
        self.count(1);
        let token = WatchToken::new(keys);
        let now = Instant::now();
        let mut state = self.state.lock().await;
        for key in token.keys() {
            state.purge_expired(key, now);
        }
        state.watches.insert(
            token.id(),
            WatchState {
                keys: token.keys().iter().cloned().collect(),
                dirty: false,
            },
        );
        Ok(token)
    }

    async fn unwatch(&self, token: WatchToken) -> RegionCacheResult<()> {
        self.check_reachable()?;
        self.count(1);
        self.state.lock().await.watches.remove(&token.id());
        Ok(())
    }

    async fn exec(&self, transaction: Transaction) -> RegionCacheResult<Option<Vec<Reply>>> {
        self.check_reachable()?;
        let (watch, commands) = transaction.into_parts();
        self.count(commands.len() + 2);

        let now = Instant::now();
        let mut state = self.state.lock().await;
        if let Some(token) = watch {
            let clean = state
                .watches
                .remove(&token.id())
                .map(|w| !w.dirty)
                .unwrap_or(false);
            if !clean {
                tracing::trace!(keys = ?token.keys(), "exec aborted by watched key change");
                return Ok(None);
            }
        }
        Ok(Some(commands.iter().map(|c| state.apply(c, now)).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regioncache_core::RegionCacheError;

    #[tokio::test]
    async fn test_set_get_del() {
        let store = InMemoryStore::new();
        store
            .execute(Command::set("a", b"1".to_vec()))
            .await
            .expect("set should succeed");
        let reply = store.execute(Command::get("a")).await.expect("get should succeed");
        assert_eq!(reply, Reply::Bulk(b"1".to_vec()));

        let reply = store.execute(Command::del("a")).await.expect("del should succeed");
        assert_eq!(reply, Reply::Int(1));
        let reply = store.execute(Command::get("a")).await.expect("get should succeed");
        assert!(reply.is_nil());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = InMemoryStore::new();
        store
            .execute(Command::set_ex("a", b"1".to_vec(), Duration::from_secs(10)))
            .await
            .expect("set should succeed");
        assert!(store.ttl("a").await.is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        let reply = store.execute(Command::get("a")).await.expect("get should succeed");
        assert!(reply.is_nil());
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let store = InMemoryStore::new();
        let first = store
            .execute(Command::set_nx_ex("lock", b"x".to_vec(), Duration::from_secs(5)))
            .await
            .expect("set should succeed");
        let second = store
            .execute(Command::set_nx_ex("lock", b"y".to_vec(), Duration::from_secs(5)))
            .await
            .expect("set should succeed");
        assert_eq!(first, Reply::Ok);
        assert_eq!(second, Reply::Nil);
    }

    #[tokio::test]
    async fn test_incr_and_rename() {
        let store = InMemoryStore::new();
        assert_eq!(store.execute(Command::incr("g")).await.expect("incr"), Reply::Int(1));
        assert_eq!(store.execute(Command::incr("g")).await.expect("incr"), Reply::Int(2));

        let err = store
            .execute(Command::rename("missing", "other"))
            .await
            .expect_err("rename of missing key should fail");
        assert!(matches!(
            err,
            RegionCacheError::Transport(TransportError::CommandFailed { .. })
        ));

        store.execute(Command::sadd("s", "m")).await.expect("sadd");
        store.execute(Command::rename("s", "t")).await.expect("rename");
        let members = store
            .execute(Command::smembers("t"))
            .await
            .expect("smembers")
            .into_array("SMEMBERS")
            .expect("array");
        assert_eq!(members, vec![Reply::Bulk(b"m".to_vec())]);
    }

    #[tokio::test]
    async fn test_wrong_type_in_transaction_does_not_abort_others() {
        let store = InMemoryStore::new();
        store.execute(Command::set("str", b"v".to_vec())).await.expect("set");
        let replies = store
            .exec(
                Transaction::new()
                    .queue(Command::sadd("str", "m"))
                    .queue(Command::incr("counter")),
            )
            .await
            .expect("exec")
            .expect("unwatched exec always commits");
        assert!(replies[0].is_error());
        assert_eq!(replies[1], Reply::Int(1));
    }

    #[tokio::test]
    async fn test_watch_aborts_on_concurrent_write() {
        let store = InMemoryStore::new();
        let token = store.watch(vec!["k".to_string()]).await.expect("watch");
        store.execute(Command::set("k", b"other".to_vec())).await.expect("set");

        let result = store
            .exec(Transaction::new().guarded_by(token).queue(Command::set("k", b"mine".to_vec())))
            .await
            .expect("exec");
        assert!(result.is_none());

        let reply = store.execute(Command::get("k")).await.expect("get");
        assert_eq!(reply, Reply::Bulk(b"other".to_vec()));
        assert_eq!(store.open_watches().await, 0);
    }

    #[tokio::test]
    async fn test_watch_commits_when_untouched() {
        let store = InMemoryStore::new();
        let token = store.watch(vec!["k".to_string()]).await.expect("watch");
        store.execute(Command::set("unrelated", b"x".to_vec())).await.expect("set");

        let result = store
            .exec(Transaction::new().guarded_by(token).queue(Command::set("k", b"mine".to_vec())))
            .await
            .expect("exec");
        assert_eq!(result, Some(vec![Reply::Ok]));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unreachable(true);
        let err = store.execute(Command::get("a")).await.expect_err("should fail");
        assert!(err.is_transport());
        assert_eq!(store.command_count(), 0);

        store.set_unreachable(false);
        assert!(store.execute(Command::get("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_lpush_and_lrange() {
        let store = InMemoryStore::new();
        store.execute(Command::lpush("l", "a")).await.expect("lpush");
        store.execute(Command::lpush("l", "b")).await.expect("lpush");
        let items = store
            .execute(Command::lrange("l", 0, -1))
            .await
            .expect("lrange")
            .into_array("LRANGE")
            .expect("array");
        assert_eq!(items, vec![Reply::Bulk(b"b".to_vec()), Reply::Bulk(b"a".to_vec())]);
    }

    #[tokio::test]
    async fn test_mget_mixes_hits_and_misses() {
        let store = InMemoryStore::new();
        store.execute(Command::set("a", b"1".to_vec())).await.expect("set");
        let reply = store
            .execute(Command::mget(vec!["a".to_string(), "b".to_string()]))
            .await
            .expect("mget");
        assert_eq!(reply, Reply::Array(vec![Reply::Bulk(b"1".to_vec()), Reply::Nil]));
    }
}
