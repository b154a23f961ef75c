//! The region facade and its capability trait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regioncache_core::{
    CacheKey, JsonCodec, LockableCachedItem, PutOutcome, RegionCacheResult, RegionConfig,
    TransportError, ValueCodec, VersionComparator,
};
use regioncache_store::StoreTransport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::accessor::CacheAccessor;
use crate::lock::{LockCoordinator, LockToken};
use crate::namespace::KeyNamespace;
use crate::versioned::VersionedPutEngine;

/// One cache region bound to a store.
///
/// Cloning is cheap; clones share the transport and the cached generation.
/// Every operation is bounded by `operation_timeout` when one is configured.
pub struct RegionCache<T, C = JsonCodec> {
    accessor: CacheAccessor<T, C>,
    versioned: VersionedPutEngine<T, C>,
    locks: LockCoordinator<T>,
    config: Arc<RegionConfig>,
}

impl<T, C: Clone> Clone for RegionCache<T, C> {
    fn clone(&self) -> Self {
        Self {
            accessor: self.accessor.clone(),
            versioned: self.versioned.clone(),
            locks: self.locks.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<T: StoreTransport> RegionCache<T, JsonCodec> {
    /// Bind `region` to `transport` with JSON-encoded values.
    pub fn new(region: impl Into<String>, transport: Arc<T>, config: RegionConfig) -> RegionCacheResult<Self> {
        Self::with_codec(region, transport, config, JsonCodec)
    }
}

impl<T: StoreTransport, C: ValueCodec + Clone> RegionCache<T, C> {
    pub fn with_codec(
        region: impl Into<String>,
        transport: Arc<T>,
        config: RegionConfig,
        codec: C,
    ) -> RegionCacheResult<Self> {
        config.validate()?;
        let namespace = Arc::new(KeyNamespace::new(region, config.region_prefix.as_deref())?);
        debug!(
            region = namespace.region(),
            expiration = ?config.expiration,
            "applied region expiration"
        );
        if let Some(prefix) = &config.region_prefix {
            debug!(region = namespace.region(), prefix = %prefix, "applied region prefix");
        }

        let config = Arc::new(config);
        let accessor = CacheAccessor::new(
            Arc::clone(&namespace),
            Arc::clone(&transport),
            codec,
            Arc::clone(&config),
        );
        let locks = LockCoordinator::new(
            Arc::clone(&namespace),
            accessor.sync().clone(),
            transport,
            Arc::clone(&config),
        );
        let versioned = VersionedPutEngine::new(accessor.clone());

        Ok(Self {
            accessor,
            versioned,
            locks,
            config,
        })
    }

    pub fn region(&self) -> &str {
        self.accessor.namespace().region()
    }

    pub fn namespace(&self) -> &KeyNamespace {
        self.accessor.namespace()
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub fn accessor(&self) -> &CacheAccessor<T, C> {
        &self.accessor
    }

    pub fn versioned(&self) -> &VersionedPutEngine<T, C> {
        &self.versioned
    }

    pub fn locks(&self) -> &LockCoordinator<T> {
        &self.locks
    }

    async fn bounded<R, F>(&self, operation: &'static str, fut: F) -> RegionCacheResult<R>
    where
        F: Future<Output = RegionCacheResult<R>>,
    {
        let Some(after) = self.config.operation_timeout else {
            return fut.await;
        };
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(region = self.region(), operation, ?after, "operation timed out");
                Err(TransportError::Timeout {
                    operation: operation.to_string(),
                    after,
                }
                .into())
            }
        }
    }

    /// Sync the local generation with the store. Returns it.
    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn sync(&self) -> RegionCacheResult<i64> {
        self.bounded("sync", self.accessor.sync().ensure_synced()).await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn get<K, V>(&self, key: &K) -> RegionCacheResult<Option<V>>
    where
        K: CacheKey + ?Sized,
        V: DeserializeOwned,
    {
        self.bounded("get", self.accessor.get(key)).await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn put<K, V>(&self, key: &K, value: &V) -> RegionCacheResult<()>
    where
        K: CacheKey + ?Sized,
        V: Serialize + ?Sized,
    {
        self.bounded("put", self.accessor.put(key, value)).await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn remove<K: CacheKey + ?Sized>(&self, key: &K) -> RegionCacheResult<()> {
        self.bounded("remove", self.accessor.remove(key)).await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn clear(&self) -> RegionCacheResult<()> {
        self.bounded("clear", self.accessor.clear()).await
    }

    pub async fn destroy(&self) -> RegionCacheResult<()> {
        self.clear().await
    }

    #[instrument(skip_all, fields(region = %self.region(), count = keys.len()))]
    pub async fn multi_get<K, V>(&self, keys: &[K]) -> RegionCacheResult<Vec<(K, V)>>
    where
        K: CacheKey + Clone,
        V: DeserializeOwned,
    {
        self.bounded("multi_get", self.accessor.multi_get(keys)).await
    }

    #[instrument(skip_all, fields(region = %self.region(), count = keys.len()))]
    pub async fn prefetch<K: CacheKey>(&self, keys: &[K]) -> RegionCacheResult<usize> {
        self.bounded("prefetch", self.accessor.prefetch(keys)).await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn versioned_put<K, V, Ver, Cmp>(
        &self,
        key: &K,
        value: V,
        version: Ver,
        comparator: &Cmp,
    ) -> RegionCacheResult<PutOutcome>
    where
        K: CacheKey + ?Sized,
        V: Serialize,
        Ver: Serialize + DeserializeOwned,
        Cmp: VersionComparator<Ver> + ?Sized,
    {
        self.bounded("versioned_put", self.versioned.put(key, value, version, comparator))
            .await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn get_item<K, V, Ver>(&self, key: &K) -> RegionCacheResult<Option<LockableCachedItem<V, Ver>>>
    where
        K: CacheKey + ?Sized,
        V: DeserializeOwned,
        Ver: DeserializeOwned,
    {
        self.bounded("get_item", self.versioned.get_item(key)).await
    }

    #[instrument(skip_all, fields(region = %self.region(), %owner))]
    pub async fn mark_locked<K, V, Ver>(&self, key: &K, owner: Uuid, timeout: Duration) -> RegionCacheResult<bool>
    where
        K: CacheKey + ?Sized,
        V: Serialize + DeserializeOwned,
        Ver: Serialize + DeserializeOwned,
    {
        self.bounded(
            "mark_locked",
            self.versioned.mark_locked::<K, V, Ver>(key, owner, timeout),
        )
        .await
    }

    #[instrument(skip_all, fields(region = %self.region(), %owner))]
    pub async fn release_mark<K, V, Ver>(&self, key: &K, owner: Uuid) -> RegionCacheResult<bool>
    where
        K: CacheKey + ?Sized,
        V: Serialize + DeserializeOwned,
        Ver: Serialize + DeserializeOwned,
    {
        self.bounded("release_mark", self.versioned.release_mark::<K, V, Ver>(key, owner))
            .await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn set_add<K, V>(&self, key: &K, member: &V) -> RegionCacheResult<bool>
    where
        K: CacheKey + ?Sized,
        V: Serialize + ?Sized,
    {
        self.bounded("set_add", self.accessor.set_add(key, member)).await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn set_remove<K, V>(&self, key: &K, member: &V) -> RegionCacheResult<bool>
    where
        K: CacheKey + ?Sized,
        V: Serialize + ?Sized,
    {
        self.bounded("set_remove", self.accessor.set_remove(key, member)).await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn set_members<K, V>(&self, key: &K) -> RegionCacheResult<Vec<V>>
    where
        K: CacheKey + ?Sized,
        V: DeserializeOwned,
    {
        self.bounded("set_members", self.accessor.set_members(key)).await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn lock<K: CacheKey + ?Sized>(&self, key: &K) -> RegionCacheResult<bool> {
        self.bounded("lock", self.locks.lock(key)).await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn try_lock<K: CacheKey + ?Sized>(&self, key: &K) -> RegionCacheResult<Option<LockToken>> {
        self.bounded("try_lock", self.locks.try_lock(key)).await
    }

    #[instrument(skip_all, fields(region = %self.region()))]
    pub async fn unlock<K: CacheKey + ?Sized>(&self, key: &K) -> RegionCacheResult<()> {
        self.bounded("unlock", self.locks.unlock(key)).await
    }

    #[instrument(skip_all, fields(region = %self.region(), owner = %token.owner()))]
    pub async fn unlock_owned(&self, token: LockToken) -> RegionCacheResult<()> {
        self.bounded("unlock_owned", self.locks.unlock_owned(token)).await
    }

    #[instrument(skip_all)]
    pub async fn garbage_list(&self) -> RegionCacheResult<Vec<String>> {
        self.bounded("garbage_list", self.accessor.garbage_list()).await
    }
}

/// The operations a region offers, one method per entry kind.
///
/// Plain, versioned and set-valued entries share one key space; each is
/// driven through its own variant operation.
#[async_trait]
pub trait RegionCacheOps: Send + Sync {
    async fn get<K, V>(&self, key: &K) -> RegionCacheResult<Option<V>>
    where
        K: CacheKey + Sync + ?Sized,
        V: DeserializeOwned + Send;

    async fn put<K, V>(&self, key: &K, value: &V) -> RegionCacheResult<()>
    where
        K: CacheKey + Sync + ?Sized,
        V: Serialize + Sync + ?Sized;

    async fn remove<K>(&self, key: &K) -> RegionCacheResult<()>
    where
        K: CacheKey + Sync + ?Sized;

    async fn clear(&self) -> RegionCacheResult<()>;

    async fn versioned_put<K, V, Ver, Cmp>(
        &self,
        key: &K,
        value: V,
        version: Ver,
        comparator: &Cmp,
    ) -> RegionCacheResult<PutOutcome>
    where
        K: CacheKey + Sync + ?Sized,
        V: Serialize + Send + Sync,
        Ver: Serialize + DeserializeOwned + Send + Sync,
        Cmp: VersionComparator<Ver> + ?Sized;

    async fn set_add<K, V>(&self, key: &K, member: &V) -> RegionCacheResult<bool>
    where
        K: CacheKey + Sync + ?Sized,
        V: Serialize + Sync + ?Sized;

    async fn set_remove<K, V>(&self, key: &K, member: &V) -> RegionCacheResult<bool>
    where
        K: CacheKey + Sync + ?Sized,
        V: Serialize + Sync + ?Sized;

    async fn set_members<K, V>(&self, key: &K) -> RegionCacheResult<Vec<V>>
    where
        K: CacheKey + Sync + ?Sized,
        V: DeserializeOwned + Send;

    async fn lock<K>(&self, key: &K) -> RegionCacheResult<bool>
    where
        K: CacheKey + Sync + ?Sized;

    async fn unlock<K>(&self, key: &K) -> RegionCacheResult<()>
    where
        K: CacheKey + Sync + ?Sized;
}

#[async_trait]
impl<T, C> RegionCacheOps for RegionCache<T, C>
where
    T: StoreTransport,
    C: ValueCodec + Clone,
{
    async fn get<K, V>(&self, key: &K) -> RegionCacheResult<Option<V>>
    where
        K: CacheKey + Sync + ?Sized,
        V: DeserializeOwned + Send,
    {
        RegionCache::get(self, key).await
    }

    async fn put<K, V>(&self, key: &K, value: &V) -> RegionCacheResult<()>
    where
        K: CacheKey + Sync + ?Sized,
        V: Serialize + Sync + ?Sized,
    {
        RegionCache::put(self, key, value).await
    }

    async fn remove<K>(&self, key: &K) -> RegionCacheResult<()>
    where
        K: CacheKey + Sync + ?Sized,
    {
        RegionCache::remove(self, key).await
    }

    async fn clear(&self) -> RegionCacheResult<()> {
        RegionCache::clear(self).await
    }

    async fn versioned_put<K, V, Ver, Cmp>(
        &self,
        key: &K,
        value: V,
        version: Ver,
        comparator: &Cmp,
    ) -> RegionCacheResult<PutOutcome>
    where
        K: CacheKey + Sync + ?Sized,
        V: Serialize + Send + Sync,
        Ver: Serialize + DeserializeOwned + Send + Sync,
        Cmp: VersionComparator<Ver> + ?Sized,
    {
        RegionCache::versioned_put(self, key, value, version, comparator).await
    }

    async fn set_add<K, V>(&self, key: &K, member: &V) -> RegionCacheResult<bool>
    where
        K: CacheKey + Sync + ?Sized,
        V: Serialize + Sync + ?Sized,
    {
        RegionCache::set_add(self, key, member).await
    }

    async fn set_remove<K, V>(&self, key: &K, member: &V) -> RegionCacheResult<bool>
    where
        K: CacheKey + Sync + ?Sized,
        V: Serialize + Sync + ?Sized,
    {
        RegionCache::set_remove(self, key, member).await
    }

    async fn set_members<K, V>(&self, key: &K) -> RegionCacheResult<Vec<V>>
    where
        K: CacheKey + Sync + ?Sized,
        V: DeserializeOwned + Send,
    {
        RegionCache::set_members(self, key).await
    }

    async fn lock<K>(&self, key: &K) -> RegionCacheResult<bool>
    where
        K: CacheKey + Sync + ?Sized,
    {
        RegionCache::lock(self, key).await
    }

    async fn unlock<K>(&self, key: &K) -> RegionCacheResult<()>
    where
        K: CacheKey + Sync + ?Sized,
    {
        RegionCache::unlock(self, key).await
    }
}
