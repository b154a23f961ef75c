//! The read/write path of a region.

use std::sync::Arc;

use regioncache_core::{
    CacheKey, InvariantError, RegionCacheResult, RegionConfig, StoredValue, TransportError,
    ValidationError, ValueCodec,
};
use regioncache_store::{Command, Reply, StoreTransport, Transaction, WatchToken};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::namespace::KeyNamespace;
use crate::sync::{commit, next_reply, GenerationSync};

/// What a compare-and-swap round decided after looking at the entry.
pub(crate) enum CasStep<R> {
    /// Commit `commands` under the watch.
    Commit { commands: Vec<Command>, result: R },
    Abort(R),
}

/// Plain get/put/remove/clear plus batched reads and set-valued entries.
///
/// Every keyed operation runs inside the generation-checked loop: the
/// authoritative generation is read in the same transaction as the keyed
/// command, and a mismatch reruns the command against the re-derived key.
pub struct CacheAccessor<T, C> {
    namespace: Arc<KeyNamespace>,
    sync: GenerationSync<T>,
    transport: Arc<T>,
    codec: C,
    config: Arc<RegionConfig>,
}

impl<T, C: Clone> Clone for CacheAccessor<T, C> {
    fn clone(&self) -> Self {
        Self {
            namespace: Arc::clone(&self.namespace),
            sync: self.sync.clone(),
            transport: Arc::clone(&self.transport),
            codec: self.codec.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<T: StoreTransport, C: ValueCodec> CacheAccessor<T, C> {
    pub fn new(
        namespace: Arc<KeyNamespace>,
        transport: Arc<T>,
        codec: C,
        config: Arc<RegionConfig>,
    ) -> Self {
        let sync = GenerationSync::new(
            Arc::clone(&namespace),
            Arc::clone(&transport),
            config.generation_retry_limit,
        );
        Self {
            namespace,
            sync,
            transport,
            codec,
            config,
        }
    }

    pub fn namespace(&self) -> &Arc<KeyNamespace> {
        &self.namespace
    }

    pub fn sync(&self) -> &GenerationSync<T> {
        &self.sync
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Encode a value for a write, rejecting the null value.
    pub(crate) fn encode_value<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
    ) -> RegionCacheResult<Vec<u8>> {
        let bytes = self.codec.encode(value)?;
        if self.codec.is_null(&bytes) {
            return Err(ValidationError::NullValue {
                key: key.to_string(),
            }
            .into());
        }
        Ok(bytes)
    }

    /// Look up `key`. The null key and absent entries are misses.
    pub async fn get<K, V>(&self, key: &K) -> RegionCacheResult<Option<V>>
    where
        K: CacheKey + ?Sized,
        V: DeserializeOwned,
    {
        if key.is_null_key() {
            return Ok(None);
        }
        let key = key.cache_key().into_owned();
        match self.get_raw(&key).await? {
            Some(bytes) => {
                let stored: StoredValue<V> = self.codec.decode(&bytes)?;
                Ok(Some(stored.into_value()))
            }
            None => Ok(None),
        }
    }

    /// Stored bytes at the entry key of a rendered, non-null key.
    pub async fn get_raw(&self, key: &str) -> RegionCacheResult<Option<Vec<u8>>> {
        debug!(region = self.namespace.region(), key, "get");
        let namespace = &self.namespace;
        let transport = &self.transport;
        self.sync
            .run_checked("get", move |generation| {
                let transaction = Transaction::new()
                    .queue(Command::get(namespace.generation_key()))
                    .queue(Command::get(namespace.global_key_at(key, 0, generation)));
                async move {
                    let mut replies = commit(transport.as_ref(), transaction).await?;
                    let observed = next_reply(&mut replies, "GET")?.into_counter("GET")?;
                    let bytes = next_reply(&mut replies, "GET")?.into_bytes("GET")?;
                    Ok((observed, bytes))
                }
            })
            .await
            .inspect_err(|e| warn!(region = namespace.region(), key, error = %e, "could not get"))
    }

    /// Store `value` under `key` with the configured expiry.
    pub async fn put<K, V>(&self, key: &K, value: &V) -> RegionCacheResult<()>
    where
        K: CacheKey + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = required_key(key)?;
        let bytes = self.encode_value(&key, value)?;
        self.put_raw(&key, bytes).await
    }

    pub(crate) async fn put_raw(&self, key: &str, bytes: Vec<u8>) -> RegionCacheResult<()> {
        debug!(region = self.namespace.region(), key, "put");
        let namespace = &self.namespace;
        let transport = &self.transport;
        let bytes = &bytes;
        let expiry = self.config.expiration;
        self.sync
            .run_checked("put", move |generation| {
                let global = namespace.global_key_at(key, 0, generation);
                let transaction = Transaction::new()
                    .queue(Command::get(namespace.generation_key()))
                    .queue(Command::set_ex(global.clone(), bytes.clone(), expiry))
                    .queue(Command::sadd(namespace.global_keys_key(), global));
                async move {
                    let mut replies = commit(transport.as_ref(), transaction).await?;
                    let observed = next_reply(&mut replies, "GET")?.into_counter("GET")?;
                    next_reply(&mut replies, "SET")?.into_written("SET")?;
                    next_reply(&mut replies, "SADD")?.into_int("SADD")?;
                    Ok((observed, ()))
                }
            })
            .await
            .inspect_err(|e| warn!(region = namespace.region(), key, error = %e, "could not put"))
    }

    /// Delete `key` at the current generation.
    pub async fn remove<K: CacheKey + ?Sized>(&self, key: &K) -> RegionCacheResult<()> {
        let key = required_key(key)?;
        let key = key.as_str();
        debug!(region = self.namespace.region(), key, "remove");
        let namespace = &self.namespace;
        let transport = &self.transport;
        self.sync
            .run_checked("remove", move |generation| {
                let transaction = Transaction::new()
                    .queue(Command::get(namespace.generation_key()))
                    .queue(Command::del(namespace.global_key_at(key, 0, generation)));
                async move {
                    let mut replies = commit(transport.as_ref(), transaction).await?;
                    let observed = next_reply(&mut replies, "GET")?.into_counter("GET")?;
                    next_reply(&mut replies, "DEL")?.into_int("DEL")?;
                    Ok((observed, ()))
                }
            })
            .await
            .inspect_err(|e| {
                warn!(region = namespace.region(), key, error = %e, "could not delete key")
            })
    }

    /// Abandon every entry of the region by advancing its generation.
    ///
    /// The live-key set is renamed to a name stamped with the abandoned
    /// generation and that name is pushed onto the garbage list. No entry is
    /// enumerated or deleted.
    pub async fn clear(&self) -> RegionCacheResult<()> {
        if self.config.no_clear {
            debug!(region = self.namespace.region(), "clear disabled by configuration");
            return Ok(());
        }
        self.clear_inner()
            .await
            .inspect_err(|e| warn!(region = self.namespace.region(), error = %e, "could not clear"))
    }

    async fn clear_inner(&self) -> RegionCacheResult<()> {
        let generation_key = self.namespace.generation_key();
        let policy = &self.config.cas_retry;
        let mut conflicts = 0;

        loop {
            let watch = self.transport.watch(vec![generation_key.clone()]).await?;
            let current = match self
                .transport
                .execute(Command::get(generation_key.clone()))
                .await
                .and_then(|reply| reply.into_counter("GET"))
            {
                Ok(current) => current,
                Err(e) => {
                    self.release(watch).await;
                    return Err(e);
                }
            };
            self.sync.reconcile(current);

            let abandoned = self.namespace.abandoned_keys_key(current);
            let transaction = Transaction::new()
                .guarded_by(watch)
                .queue(Command::incr(generation_key.clone()))
                .queue(Command::rename(self.namespace.global_keys_key(), abandoned.clone()))
                .queue(Command::lpush(self.namespace.garbage_list_key(), abandoned.clone()));

            let Some(replies) = self.transport.exec(transaction).await? else {
                conflicts += 1;
                if conflicts >= policy.max_attempts {
                    return Err(InvariantError::ContentionRetriesExhausted {
                        key: generation_key,
                        attempts: conflicts,
                    }
                    .into());
                }
                tokio::time::sleep(policy.delay_for(conflicts)).await;
                continue;
            };

            let mut replies = replies.into_iter();
            let generation = next_reply(&mut replies, "INCR")?.into_int("INCR")?;
            match next_reply(&mut replies, "RENAME")? {
                Reply::Error(reason) if reason.contains("no such key") => {
                    debug!(
                        region = self.namespace.region(),
                        keys = %self.namespace.global_keys_key(),
                        "no live-key set to rename"
                    );
                }
                Reply::Error(reason) => {
                    return Err(TransportError::CommandFailed {
                        command: "RENAME".to_string(),
                        reason,
                    }
                    .into())
                }
                _ => {}
            }
            next_reply(&mut replies, "LPUSH")?.into_int("LPUSH")?;

            self.namespace.set_generation(generation);
            debug!(
                region = self.namespace.region(),
                abandoned = current,
                generation,
                garbage = %abandoned,
                "region cleared"
            );
            return Ok(());
        }
    }

    /// Same as [`clear`](Self::clear).
    pub async fn destroy(&self) -> RegionCacheResult<()> {
        self.clear().await
    }

    /// Batched read. Returns `(key, value)` for the keys that hit, in request
    /// order. Null keys are skipped.
    pub async fn multi_get<K, V>(&self, keys: &[K]) -> RegionCacheResult<Vec<(K, V)>>
    where
        K: CacheKey + Clone,
        V: DeserializeOwned,
    {
        let live: Vec<&K> = keys.iter().filter(|k| !k.is_null_key()).collect();
        let rendered: Vec<String> = live.iter().map(|k| k.cache_key().into_owned()).collect();
        let raw = self.multi_get_raw(&rendered).await?;

        let mut hits = Vec::new();
        for (key, bytes) in live.into_iter().zip(raw) {
            if let Some(bytes) = bytes {
                let stored: StoredValue<V> = self.codec.decode(&bytes)?;
                hits.push((key.clone(), stored.into_value()));
            }
        }
        Ok(hits)
    }

    /// Warm-up read. Counts hits and keeps nothing locally.
    pub async fn prefetch<K: CacheKey>(&self, keys: &[K]) -> RegionCacheResult<usize> {
        let rendered: Vec<String> = keys
            .iter()
            .filter(|k| !k.is_null_key())
            .map(|k| k.cache_key().into_owned())
            .collect();
        let raw = self.multi_get_raw(&rendered).await?;
        Ok(raw.iter().filter(|b| b.is_some()).count())
    }

    async fn multi_get_raw(&self, keys: &[String]) -> RegionCacheResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        debug!(region = self.namespace.region(), count = keys.len(), "multi get");
        let namespace = &self.namespace;
        let transport = &self.transport;
        self.sync
            .run_checked("multi_get", move |generation| {
                let globals = keys
                    .iter()
                    .map(|k| namespace.global_key_at(k, 0, generation))
                    .collect();
                let transaction = Transaction::new()
                    .queue(Command::get(namespace.generation_key()))
                    .queue(Command::mget(globals));
                async move {
                    let mut replies = commit(transport.as_ref(), transaction).await?;
                    let observed = next_reply(&mut replies, "GET")?.into_counter("GET")?;
                    let values = next_reply(&mut replies, "MGET")?
                        .into_array("MGET")?
                        .into_iter()
                        .map(|r| r.into_bytes("MGET"))
                        .collect::<RegionCacheResult<Vec<_>>>()?;
                    Ok((observed, values))
                }
            })
            .await
            .inspect_err(|e| warn!(region = namespace.region(), error = %e, "could not get"))
    }

    /// Add `member` to the set-valued entry at `key`. Returns whether it was new.
    pub async fn set_add<K, V>(&self, key: &K, member: &V) -> RegionCacheResult<bool>
    where
        K: CacheKey + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = required_key(key)?;
        let member = self.encode_value(&key, member)?;
        let (key, member) = (key.as_str(), &member);
        debug!(region = self.namespace.region(), key, "set add");
        let keys_key = self.namespace.global_keys_key();
        let expiry = self.config.expiration;
        let (_, replies) = self
            .compare_and_swap(key, |current, global| match current {
                Reply::Bulk(_) => Err(InvariantError::UnexpectedShape {
                    key: global.to_string(),
                    reason: "entry holds a plain value, not a set".to_string(),
                }
                .into()),
                _ => Ok(CasStep::Commit {
                    commands: vec![
                        Command::sadd(global, member.clone()),
                        Command::expire(global, expiry),
                        Command::sadd(keys_key.clone(), global),
                    ],
                    result: (),
                }),
            })
            .await
            .inspect_err(|e| warn!(region = self.namespace.region(), key, error = %e, "could not put"))?;
        let added = next_reply(&mut replies.into_iter(), "SADD")?.into_int("SADD")?;
        Ok(added == 1)
    }

    /// Remove `member` from the set at `key`. Returns whether it was present.
    pub async fn set_remove<K, V>(&self, key: &K, member: &V) -> RegionCacheResult<bool>
    where
        K: CacheKey + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = required_key(key)?;
        let member = self.encode_value(&key, member)?;
        let (key, member) = (key.as_str(), &member);
        debug!(region = self.namespace.region(), key, "set remove");
        let namespace = &self.namespace;
        let transport = &self.transport;
        self.sync
            .run_checked("set_remove", move |generation| {
                let transaction = Transaction::new()
                    .queue(Command::get(namespace.generation_key()))
                    .queue(Command::srem(namespace.global_key_at(key, 0, generation), member.clone()));
                async move {
                    let mut replies = commit(transport.as_ref(), transaction).await?;
                    let observed = next_reply(&mut replies, "GET")?.into_counter("GET")?;
                    let removed = next_reply(&mut replies, "SREM")?.into_int("SREM")?;
                    Ok((observed, removed == 1))
                }
            })
            .await
            .inspect_err(|e| {
                warn!(region = namespace.region(), key, error = %e, "could not delete key")
            })
    }

    /// Members of the set at `key`; empty for the null key or a missing set.
    pub async fn set_members<K, V>(&self, key: &K) -> RegionCacheResult<Vec<V>>
    where
        K: CacheKey + ?Sized,
        V: DeserializeOwned,
    {
        if key.is_null_key() {
            return Ok(Vec::new());
        }
        let key = key.cache_key().into_owned();
        let key = key.as_str();
        let namespace = &self.namespace;
        let transport = &self.transport;
        let members = self
            .sync
            .run_checked("set_members", move |generation| {
                let transaction = Transaction::new()
                    .queue(Command::get(namespace.generation_key()))
                    .queue(Command::smembers(namespace.global_key_at(key, 0, generation)));
                async move {
                    let mut replies = commit(transport.as_ref(), transaction).await?;
                    let observed = next_reply(&mut replies, "GET")?.into_counter("GET")?;
                    let members = next_reply(&mut replies, "SMEMBERS")?.into_array("SMEMBERS")?;
                    Ok((observed, members))
                }
            })
            .await
            .inspect_err(|e| warn!(region = namespace.region(), key, error = %e, "could not get"))?;

        members
            .into_iter()
            .filter_map(|reply| reply.into_bytes("SMEMBERS").transpose())
            .map(|bytes| -> RegionCacheResult<V> { Ok(self.codec.decode(&bytes?)?) })
            .collect()
    }

    /// Names of abandoned live-key sets awaiting the reaper, newest first.
    pub async fn garbage_list(&self) -> RegionCacheResult<Vec<String>> {
        let items = self
            .transport
            .execute(Command::lrange(self.namespace.garbage_list_key(), 0, -1))
            .await?
            .into_array("LRANGE")?;
        items
            .into_iter()
            .filter_map(|reply| reply.into_bytes("LRANGE").transpose())
            .map(|bytes| bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
            .collect()
    }

    /// WATCH, snapshot, decide, commit; repeated until the commit survives.
    ///
    /// `decide` sees the GET reply for the entry key and the entry key itself.
    /// Generation drift restarts the round against the re-derived key and
    /// counts against the generation retry limit; lost commits back off and
    /// count against the CAS retry policy. Returns the decision with the
    /// committed replies, which are empty when `decide` aborted.
    pub(crate) async fn compare_and_swap<R, F>(
        &self,
        key: &str,
        mut decide: F,
    ) -> RegionCacheResult<(R, Vec<Reply>)>
    where
        F: FnMut(&Reply, &str) -> RegionCacheResult<CasStep<R>>,
    {
        let policy = &self.config.cas_retry;
        let generation_key = self.namespace.generation_key();

        let mut drift = 0;
        let mut conflicts = 0;
        loop {
            let generation = self.sync.ensure_synced().await?;
            let global = self.namespace.global_key_at(key, 0, generation);
            let watch = self
                .transport
                .watch(vec![generation_key.clone(), global.clone()])
                .await?;

            let snapshot = match self
                .transport
                .pipeline(vec![Command::get(generation_key.clone()), Command::get(global.clone())])
                .await
            {
                Ok(replies) => read_snapshot(replies),
                Err(e) => Err(e),
            };
            let (observed, current) = match snapshot {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.release(watch).await;
                    return Err(e);
                }
            };

            if self.sync.reconcile(observed) {
                self.release(watch).await;
                drift += 1;
                if drift >= self.sync.retry_limit() {
                    return Err(InvariantError::GenerationRetriesExhausted {
                        region: self.namespace.region().to_string(),
                        attempts: drift,
                    }
                    .into());
                }
                continue;
            }

            let (commands, result) = match decide(&current, &global) {
                Ok(CasStep::Commit { commands, result }) => (commands, result),
                Ok(CasStep::Abort(result)) => {
                    self.release(watch).await;
                    return Ok((result, Vec::new()));
                }
                Err(e) => {
                    self.release(watch).await;
                    return Err(e);
                }
            };

            let names: Vec<&'static str> = commands.iter().map(Command::name).collect();
            let transaction = commands
                .into_iter()
                .fold(Transaction::new().guarded_by(watch), |txn, command| txn.queue(command));

            match self.transport.exec(transaction).await? {
                Some(replies) => {
                    for (reply, command) in replies.iter().zip(names) {
                        if let Reply::Error(reason) = reply {
                            return Err(TransportError::CommandFailed {
                                command: command.to_string(),
                                reason: reason.clone(),
                            }
                            .into());
                        }
                    }
                    return Ok((result, replies));
                }
                None => {
                    conflicts += 1;
                    if conflicts >= policy.max_attempts {
                        return Err(InvariantError::ContentionRetriesExhausted {
                            key: global,
                            attempts: conflicts,
                        }
                        .into());
                    }
                    let delay = policy.delay_for(conflicts);
                    debug!(
                        region = self.namespace.region(),
                        key = %global,
                        attempt = conflicts,
                        ?delay,
                        "concurrent write; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Best-effort `UNWATCH` on an error path.
    pub(crate) async fn release(&self, watch: WatchToken) {
        if let Err(e) = self.transport.unwatch(watch).await {
            debug!(region = self.namespace.region(), error = %e, "unwatch failed");
        }
    }
}

fn read_snapshot(replies: Vec<Reply>) -> RegionCacheResult<(i64, Reply)> {
    let mut replies = replies.into_iter();
    let observed = next_reply(&mut replies, "GET")?.into_counter("GET")?;
    let current = next_reply(&mut replies, "GET")?;
    Ok((observed, current))
}

/// Render a key for a write, rejecting the null key.
pub(crate) fn required_key<K: CacheKey + ?Sized>(key: &K) -> RegionCacheResult<String> {
    if key.is_null_key() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "key".to_string(),
        }
        .into());
    }
    Ok(key.cache_key().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regioncache_core::{JsonCodec, RegionCacheError};
    use regioncache_store::InMemoryStore;

    fn accessor(
        store: &Arc<InMemoryStore>,
        region: &str,
        config: RegionConfig,
    ) -> CacheAccessor<InMemoryStore, JsonCodec> {
        let ns = Arc::new(KeyNamespace::new(region, config.region_prefix.as_deref()).expect("region"));
        CacheAccessor::new(ns, Arc::clone(store), JsonCodec, Arc::new(config))
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = InMemoryStore::shared();
        let cache = accessor(&store, "users", RegionConfig::default());
        cache.put("alice", &"admin").await.expect("put should succeed");
        let value: Option<String> = cache.get("alice").await.expect("get should succeed");
        assert_eq!(value.as_deref(), Some("admin"));
        assert!(store.keys().await.contains(&"users:0:alice".to_string()));
    }

    #[tokio::test]
    async fn test_null_key_and_value() {
        let store = InMemoryStore::shared();
        let cache = accessor(&store, "users", RegionConfig::default());

        let miss: Option<String> = cache.get("").await.expect("null key is a miss");
        assert!(miss.is_none());

        let err = cache.put("", &1).await.expect_err("null key");
        assert!(matches!(
            err,
            RegionCacheError::Validation(ValidationError::RequiredFieldMissing { .. })
        ));
        let err = cache.put("k", &Option::<u8>::None).await.expect_err("null value");
        assert!(matches!(err, RegionCacheError::Validation(ValidationError::NullValue { .. })));
        let err = cache.remove("").await.expect_err("null key");
        assert!(err.is_precondition());

        assert_eq!(store.command_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_applies_expiry() {
        let store = InMemoryStore::shared();
        let config = RegionConfig::default().with_expiration(std::time::Duration::from_secs(60));
        let cache = accessor(&store, "r", config);
        cache.put("k", &1u32).await.expect("put");

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        let value: Option<u32> = cache.get("k").await.expect("get");
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_clear_abandons_entries() {
        let store = InMemoryStore::shared();
        let cache = accessor(&store, "r", RegionConfig::default().with_prefix("app"));
        cache.put("a", &1).await.expect("put");
        cache.put("b", &2).await.expect("put");

        cache.clear().await.expect("clear");
        assert_eq!(cache.namespace().generation(), 1);
        let a: Option<i32> = cache.get("a").await.expect("get");
        assert!(a.is_none());

        let garbage = cache.garbage_list().await.expect("garbage");
        assert_eq!(garbage, vec!["temp_app_r_keys_0".to_string()]);
        assert!(store.keys().await.contains(&"temp_app_r_keys_0".to_string()));
    }

    #[tokio::test]
    async fn test_clear_without_entries() {
        let store = InMemoryStore::shared();
        let cache = accessor(&store, "r", RegionConfig::default());
        cache.clear().await.expect("clear of an empty region");
        cache.destroy().await.expect("destroy");
        assert_eq!(cache.namespace().generation(), 2);
        assert_eq!(cache.garbage_list().await.expect("garbage").len(), 2);
    }

    #[tokio::test]
    async fn test_no_clear_is_noop() {
        let store = InMemoryStore::shared();
        let cache = accessor(&store, "r", RegionConfig::default().with_no_clear(true));
        cache.put("a", &1).await.expect("put");
        cache.clear().await.expect("clear");
        let a: Option<i32> = cache.get("a").await.expect("get");
        assert_eq!(a, Some(1));
    }

    #[tokio::test]
    async fn test_stale_instance_follows_generation() {
        let store = InMemoryStore::shared();
        let first = accessor(&store, "r", RegionConfig::default());
        let second = accessor(&store, "r", RegionConfig::default());
        first.put("k", &"old").await.expect("put");
        let seen: Option<String> = second.get("k").await.expect("get");
        assert_eq!(seen.as_deref(), Some("old"));

        first.clear().await.expect("clear");
        assert_eq!(second.namespace().generation(), 0);
        let seen: Option<String> = second.get("k").await.expect("get");
        assert!(seen.is_none());
        assert_eq!(second.namespace().generation(), 1);

        second.put("k", &"new").await.expect("put");
        let seen: Option<String> = first.get("k").await.expect("get");
        assert_eq!(seen.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_multi_get_preserves_order() {
        let store = InMemoryStore::shared();
        let cache = accessor(&store, "r", RegionConfig::default());
        for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
            cache.put(k, &v).await.expect("put");
        }
        cache.remove("b").await.expect("remove");

        let hits: Vec<(&str, i32)> = cache.multi_get(&["c", "b", "", "a"]).await.expect("multi get");
        assert_eq!(hits, vec![("c", 3), ("a", 1)]);
        assert_eq!(cache.prefetch(&["a", "b", "c"]).await.expect("prefetch"), 2);

        let none: Vec<(&str, i32)> = cache.multi_get(&[]).await.expect("empty");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_set_valued_entries() {
        let store = InMemoryStore::shared();
        let cache = accessor(&store, "r", RegionConfig::default());
        assert!(cache.set_add("tags", "x").await.expect("sadd"));
        assert!(cache.set_add("tags", "y").await.expect("sadd"));
        assert!(!cache.set_add("tags", "x").await.expect("sadd"));
        assert!(cache.set_remove("tags", "y").await.expect("srem"));

        let members: Vec<String> = cache.set_members("tags").await.expect("smembers");
        assert_eq!(members, vec!["x".to_string()]);

        cache.clear().await.expect("clear");
        let members: Vec<String> = cache.set_members("tags").await.expect("smembers");
        assert!(members.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_add_on_plain_entry_leaves_it_alone() {
        let store = InMemoryStore::shared();
        let config = RegionConfig::default().with_expiration(std::time::Duration::from_secs(60));
        let cache = accessor(&store, "r", config);
        cache.put("k", &"plain").await.expect("put");
        tokio::time::advance(std::time::Duration::from_secs(30)).await;

        let err = cache.set_add("k", "m").await.expect_err("plain entry");
        assert!(matches!(
            err,
            RegionCacheError::Invariant(InvariantError::UnexpectedShape { .. })
        ));
        let ttl = store.ttl("r:0:k").await.expect("entry still expiring");
        assert!(ttl <= std::time::Duration::from_secs(30));
        let value: Option<String> = cache.get("k").await.expect("get");
        assert_eq!(value.as_deref(), Some("plain"));
        assert_eq!(store.open_watches().await, 0);
    }

    #[tokio::test]
    async fn test_set_add_registers_and_expires_new_set() {
        let store = InMemoryStore::shared();
        let cache = accessor(&store, "r", RegionConfig::default());
        assert!(cache.set_add("tags", "x").await.expect("sadd"));
        assert!(store.ttl("r:0:tags").await.is_some());

        cache.clear().await.expect("clear");
        let abandoned = store
            .execute(Command::smembers("temp_r_keys_0"))
            .await
            .expect("smembers")
            .into_array("SMEMBERS")
            .expect("array");
        assert_eq!(abandoned, vec![Reply::Bulk(b"r:0:tags".to_vec())]);
    }

    #[tokio::test]
    async fn test_clear_on_corrupt_generation_releases_watch() {
        let store = InMemoryStore::shared();
        store
            .execute(Command::set("r_generation", b"not-a-number".to_vec()))
            .await
            .expect("seed");
        let cache = accessor(&store, "r", RegionConfig::default());

        let err = cache.clear().await.expect_err("generation is not a counter");
        assert!(err.is_transport());
        assert_eq!(store.open_watches().await, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let store = InMemoryStore::shared();
        let cache = accessor(&store, "r", RegionConfig::default());
        store.set_unreachable(true);
        let err = cache.put("k", &1).await.expect_err("unreachable");
        assert!(err.is_transport());
        let err = cache.get::<_, i32>("k").await.expect_err("unreachable");
        assert!(err.is_transport());
    }
}
