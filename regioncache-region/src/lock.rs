//! Advisory per-key locks.

use std::sync::Arc;
use std::time::Duration;

use regioncache_core::{CacheKey, InvariantError, LockError, RegionCacheResult, RegionConfig};
use regioncache_store::{Command, StoreTransport, Transaction};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::accessor::required_key;
use crate::namespace::{KeyNamespace, LOCK_TAGS};
use crate::sync::{commit, next_reply, GenerationSync};

/// Proof of a lock acquired with [`LockCoordinator::try_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    lock_key: String,
    owner: Uuid,
}

impl LockToken {
    /// Logical key the lock guards.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store key of the lock.
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }
}

/// Acquires and releases locks with `SET NX EX` on lock-tagged keys.
///
/// Lock keys are generation-scoped. Acquisition sets the lock under a watch
/// on the generation counter, so every client locks the key of the current
/// generation, and a `clear` releases every lock of the region.
pub struct LockCoordinator<T> {
    namespace: Arc<KeyNamespace>,
    sync: GenerationSync<T>,
    transport: Arc<T>,
    config: Arc<RegionConfig>,
}

impl<T> Clone for LockCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            namespace: Arc::clone(&self.namespace),
            sync: self.sync.clone(),
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
        }
    }
}

impl<T: StoreTransport> LockCoordinator<T> {
    pub fn new(
        namespace: Arc<KeyNamespace>,
        sync: GenerationSync<T>,
        transport: Arc<T>,
        config: Arc<RegionConfig>,
    ) -> Self {
        Self {
            namespace,
            sync,
            transport,
            config,
        }
    }

    /// Take the lock on `key`. Returns false if it stayed held for the whole
    /// acquisition timeout.
    pub async fn lock<K: CacheKey + ?Sized>(&self, key: &K) -> RegionCacheResult<bool> {
        Ok(self.try_lock(key).await?.is_some())
    }

    /// Take the lock on `key` and return a token naming its owner.
    pub async fn try_lock<K: CacheKey + ?Sized>(&self, key: &K) -> RegionCacheResult<Option<LockToken>> {
        let key = required_key(key)?;
        let owner = Uuid::now_v7();

        let deadline = Instant::now() + self.config.lock_acquisition_timeout;
        let policy = &self.config.cas_retry;
        let mut attempt = 0;
        loop {
            let acquired = self.acquire(&key, owner).await.inspect_err(|e| {
                warn!(region = self.namespace.region(), key = %key, error = %e, "could not acquire lock")
            })?;

            if let Some(lock_key) = acquired {
                debug!(region = self.namespace.region(), key = %key, %owner, "lock acquired");
                return Ok(Some(LockToken {
                    key,
                    lock_key,
                    owner,
                }));
            }

            attempt += 1;
            let now = Instant::now();
            if now >= deadline {
                debug!(region = self.namespace.region(), key = %key, attempts = attempt, "lock held elsewhere");
                return Ok(None);
            }
            let delay = policy
                .delay_for(attempt)
                .max(Duration::from_millis(1))
                .min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Delete the lock on `key` whoever holds it.
    pub async fn unlock<K: CacheKey + ?Sized>(&self, key: &K) -> RegionCacheResult<()> {
        let key = required_key(key)?;
        let namespace = &self.namespace;
        let transport = &self.transport;
        let lock_of = key.as_str();
        self.sync
            .run_checked("unlock", move |generation| {
                let transaction = Transaction::new()
                    .queue(Command::get(namespace.generation_key()))
                    .queue(Command::del(namespace.global_key_at(lock_of, LOCK_TAGS, generation)));
                async move {
                    let mut replies = commit(transport.as_ref(), transaction).await?;
                    let observed = next_reply(&mut replies, "GET")?.into_counter("GET")?;
                    next_reply(&mut replies, "DEL")?.into_int("DEL")?;
                    Ok((observed, ()))
                }
            })
            .await
            .inspect_err(|e| {
                warn!(region = namespace.region(), key = %key, error = %e, "could not release lock")
            })?;
        debug!(region = namespace.region(), key = %key, "lock released");
        Ok(())
    }

    /// One `SET NX EX` against the lock key of the authoritative generation.
    ///
    /// The generation is read under a watch and the set commits only if the
    /// counter is unchanged. Returns the lock key when the lock was taken.
    async fn acquire(&self, key: &str, owner: Uuid) -> RegionCacheResult<Option<String>> {
        let generation_key = self.namespace.generation_key();
        for _ in 0..self.sync.retry_limit() {
            let watch = self.transport.watch(vec![generation_key.clone()]).await?;
            let generation = match self.sync.fetch().await {
                Ok(generation) => generation,
                Err(e) => {
                    let _ = self.transport.unwatch(watch).await;
                    return Err(e);
                }
            };
            self.sync.reconcile(generation);

            let lock_key = self.namespace.global_key_at(key, LOCK_TAGS, generation);
            let transaction = Transaction::new().guarded_by(watch).queue(Command::set_nx_ex(
                lock_key.clone(),
                owner.to_string().into_bytes(),
                self.config.lock_timeout,
            ));
            let Some(replies) = self.transport.exec(transaction).await? else {
                debug!(region = self.namespace.region(), key, "generation moved while locking; retrying");
                continue;
            };
            let acquired = next_reply(&mut replies.into_iter(), "SET")?.into_written("SET")?;
            return Ok(acquired.then_some(lock_key));
        }
        Err(InvariantError::GenerationRetriesExhausted {
            region: self.namespace.region().to_string(),
            attempts: self.sync.retry_limit(),
        }
        .into())
    }

    /// Release a lock taken with [`try_lock`](Self::try_lock).
    ///
    /// With `verify_lock_owner` set the lock is only deleted if it still
    /// holds the token's owner, and [`LockError::NotOwner`] is returned
    /// otherwise. Without it this is [`unlock`](Self::unlock).
    pub async fn unlock_owned(&self, token: LockToken) -> RegionCacheResult<()> {
        if !self.config.verify_lock_owner {
            return self.delete(&token.key, token.lock_key.clone()).await;
        }

        let owner = token.owner.to_string().into_bytes();
        let policy = &self.config.cas_retry;
        let mut conflicts = 0;
        loop {
            let watch = self.transport.watch(vec![token.lock_key.clone()]).await?;
            let held_by = match self
                .transport
                .execute(Command::get(token.lock_key.clone()))
                .await
                .and_then(|reply| reply.into_bytes("GET"))
            {
                Ok(held_by) => held_by,
                Err(e) => {
                    let _ = self.transport.unwatch(watch).await;
                    warn!(region = self.namespace.region(), key = %token.key, error = %e, "could not release lock");
                    return Err(e);
                }
            };

            if held_by.as_deref() != Some(owner.as_slice()) {
                let _ = self.transport.unwatch(watch).await;
                debug!(region = self.namespace.region(), key = %token.key, owner = %token.owner, "lock not held by owner");
                return Err(LockError::NotOwner { key: token.key }.into());
            }

            let transaction = Transaction::new()
                .guarded_by(watch)
                .queue(Command::del(token.lock_key.clone()));
            match self.transport.exec(transaction).await? {
                Some(replies) => {
                    next_reply(&mut replies.into_iter(), "DEL")?.into_int("DEL")?;
                    debug!(region = self.namespace.region(), key = %token.key, "lock released");
                    return Ok(());
                }
                None => {
                    conflicts += 1;
                    if conflicts >= policy.max_attempts {
                        return Err(InvariantError::ContentionRetriesExhausted {
                            key: token.lock_key,
                            attempts: conflicts,
                        }
                        .into());
                    }
                    tokio::time::sleep(policy.delay_for(conflicts)).await;
                }
            }
        }
    }

    async fn delete(&self, key: &str, lock_key: String) -> RegionCacheResult<()> {
        self.transport
            .execute(Command::del(lock_key))
            .await
            .and_then(|reply| reply.into_int("DEL"))
            .inspect_err(|e| {
                warn!(region = self.namespace.region(), key, error = %e, "could not release lock")
            })?;
        debug!(region = self.namespace.region(), key, "lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regioncache_core::RegionCacheError;
    use regioncache_store::InMemoryStore;

    fn coordinator(store: &Arc<InMemoryStore>, config: RegionConfig) -> LockCoordinator<InMemoryStore> {
        let ns = Arc::new(KeyNamespace::new("r", None).expect("region"));
        let sync = GenerationSync::new(Arc::clone(&ns), Arc::clone(store), config.generation_retry_limit);
        LockCoordinator::new(ns, sync, Arc::clone(store), Arc::new(config))
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let store = InMemoryStore::shared();
        let locks = coordinator(&store, RegionConfig::default());

        assert!(locks.lock("k").await.expect("lock"));
        assert!(!locks.lock("k").await.expect("lock"));
        assert!(locks.lock("other").await.expect("lock"));

        locks.unlock("k").await.expect("unlock");
        assert!(locks.lock("k").await.expect("lock"));
        assert!(store.keys().await.contains(&"r:0:#k".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires() {
        let store = InMemoryStore::shared();
        let config = RegionConfig::default().with_lock_timeout(Duration::from_secs(5));
        let locks = coordinator(&store, config);

        assert!(locks.lock("k").await.expect("lock"));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(locks.lock("k").await.expect("lock after expiry"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_waits_for_release() {
        let store = InMemoryStore::shared();
        let config = RegionConfig::default()
            .with_lock_timeout(Duration::from_secs(2))
            .with_lock_acquisition_timeout(Duration::from_secs(10));
        let locks = coordinator(&store, config);

        assert!(locks.lock("k").await.expect("lock"));
        // the first holder's lock lapses while the second caller polls
        assert!(locks.lock("k").await.expect("lock acquired after polling"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_gives_up_after_acquisition_timeout() {
        let store = InMemoryStore::shared();
        let config = RegionConfig::default()
            .with_lock_timeout(Duration::from_secs(60))
            .with_lock_acquisition_timeout(Duration::from_secs(1));
        let locks = coordinator(&store, config);

        assert!(locks.lock("k").await.expect("lock"));
        let started = Instant::now();
        assert!(!locks.lock("k").await.expect("lock"));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unconditional_unlock_releases_any_holder() {
        let store = InMemoryStore::shared();
        let locks = coordinator(&store, RegionConfig::default());
        let token = locks.try_lock("k").await.expect("lock").expect("acquired");
        locks.unlock("k").await.expect("unlock");

        let second = locks.try_lock("k").await.expect("lock").expect("acquired");
        assert_ne!(token.owner(), second.owner());
        // without owner checks a stale token still releases the new holder
        locks.unlock_owned(token).await.expect("unlock");
        assert!(locks.lock("k").await.expect("lock"));
    }

    #[tokio::test]
    async fn test_owner_checked_unlock() {
        let store = InMemoryStore::shared();
        let locks = coordinator(&store, RegionConfig::default().with_verify_lock_owner(true));
        let stale = locks.try_lock("k").await.expect("lock").expect("acquired");
        locks.unlock("k").await.expect("unlock");
        let current = locks.try_lock("k").await.expect("lock").expect("acquired");

        let err = locks.unlock_owned(stale).await.expect_err("not the owner");
        assert!(matches!(err, RegionCacheError::Lock(LockError::NotOwner { .. })));
        assert!(!locks.lock("k").await.expect("still held"));

        locks.unlock_owned(current).await.expect("owner releases");
        assert!(locks.lock("k").await.expect("lock"));
        assert_eq!(store.open_watches().await, 0);
    }

    #[tokio::test]
    async fn test_null_key_is_rejected() {
        let store = InMemoryStore::shared();
        let locks = coordinator(&store, RegionConfig::default());
        let err = locks.lock("").await.expect_err("null key");
        assert!(err.is_precondition());
    }
}
