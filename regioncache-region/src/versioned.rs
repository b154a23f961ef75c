//! Version-aware writes.
//!
//! A versioned put only lands when the caller's version is strictly newer
//! than the stored one under the caller's comparator. The decision is taken
//! against a snapshot read under `WATCH`, and the write commits only if
//! neither the generation counter nor the entry changed in between.
//! Otherwise the whole read-decide-commit cycle runs again after a backoff.

use std::time::Duration;

use chrono::Utc;
use regioncache_core::{
    CacheKey, InvariantError, LockableCachedItem, PutOutcome, RegionCacheError, RegionCacheResult,
    ValidationError, ValueCodec, VersionComparator,
};
use regioncache_store::{Command, Reply, StoreTransport};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::accessor::{required_key, CacheAccessor, CasStep};

/// The payload slot of an encoded item, skimmed for the null value.
#[derive(Deserialize)]
struct PayloadSlot {
    value: Option<IgnoredAny>,
}

/// Optimistic compare-and-swap writes of [`LockableCachedItem`]s.
pub struct VersionedPutEngine<T, C> {
    accessor: CacheAccessor<T, C>,
}

impl<T, C: Clone> Clone for VersionedPutEngine<T, C> {
    fn clone(&self) -> Self {
        Self {
            accessor: self.accessor.clone(),
        }
    }
}

impl<T: StoreTransport, C: ValueCodec> VersionedPutEngine<T, C> {
    pub fn new(accessor: CacheAccessor<T, C>) -> Self {
        Self { accessor }
    }

    /// Write `value` stamped with `version` if it is newer than what is stored.
    ///
    /// A stored value that is not a versioned item is a fatal
    /// [`InvariantError::UnexpectedShape`]. A stale version, or an item
    /// carrying an active lock marker, yields [`PutOutcome::Rejected`].
    pub async fn put<K, V, Ver, Cmp>(
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
        let key = required_key(key)?;
        let candidate = LockableCachedItem::new(value, version);
        let codec = self.accessor.codec();
        let bytes = codec.encode(&candidate)?;
        let slot: PayloadSlot = codec.decode(&bytes)?;
        if slot.value.is_none() {
            return Err(ValidationError::NullValue { key }.into());
        }

        let (outcome, _) = self
            .accessor
            .compare_and_swap(&key, |current, global| {
                let Some(current) = stored_item(current, global)? else {
                    return Ok(CasStep::Commit {
                        commands: self.write_item(global, bytes.clone()),
                        result: PutOutcome::Created,
                    });
                };
                let existing: LockableCachedItem<IgnoredAny, Ver> = decode_item(codec, current, global)?;
                if existing.is_puttable(&candidate.version, comparator, Utc::now()) {
                    Ok(CasStep::Commit {
                        commands: self.write_item(global, bytes.clone()),
                        result: PutOutcome::Updated,
                    })
                } else {
                    Ok(CasStep::Abort(PutOutcome::Rejected))
                }
            })
            .await
            .inspect_err(|e| {
                warn!(region = self.accessor.namespace().region(), key = %key, error = %e, "could not put")
            })?;

        debug!(
            region = self.accessor.namespace().region(),
            key = %key,
            ?outcome,
            "versioned put"
        );
        Ok(outcome)
    }

    /// Read the full versioned item at `key`.
    pub async fn get_item<K, V, Ver>(&self, key: &K) -> RegionCacheResult<Option<LockableCachedItem<V, Ver>>>
    where
        K: CacheKey + ?Sized,
        V: DeserializeOwned,
        Ver: DeserializeOwned,
    {
        if key.is_null_key() {
            return Ok(None);
        }
        let key = key.cache_key().into_owned();
        match self.accessor.get_raw(&key).await? {
            Some(bytes) => {
                let global = self.accessor.namespace().global_key(&key, 0);
                decode_item(self.accessor.codec(), &bytes, &global).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Fence the item at `key` for `owner` until `timeout` elapses.
    ///
    /// While the marker is active no versioned put lands, whatever its
    /// version. Returns false when there is no item or another owner's
    /// marker is active.
    pub async fn mark_locked<K, V, Ver>(
        &self,
        key: &K,
        owner: Uuid,
        timeout: Duration,
    ) -> RegionCacheResult<bool>
    where
        K: CacheKey + ?Sized,
        V: Serialize + DeserializeOwned,
        Ver: Serialize + DeserializeOwned,
    {
        let key = required_key(key)?;
        let codec = self.accessor.codec();
        let (marked, _) = self
            .accessor
            .compare_and_swap(&key, |current, global| {
                let Some(current) = stored_item(current, global)? else {
                    return Ok(CasStep::Abort(false));
                };
                let mut item: LockableCachedItem<V, Ver> = decode_item(codec, current, global)?;
                if !item.lock(owner, timeout, Utc::now()) {
                    return Ok(CasStep::Abort(false));
                }
                Ok(CasStep::Commit {
                    commands: self.write_item(global, codec.encode(&item)?),
                    result: true,
                })
            })
            .await?;
        Ok(marked)
    }

    /// Remove `owner`'s marker from the item at `key`.
    ///
    /// Expired markers are removed whoever placed them. Returns false when
    /// there is no item or another owner's marker is still active.
    pub async fn release_mark<K, V, Ver>(&self, key: &K, owner: Uuid) -> RegionCacheResult<bool>
    where
        K: CacheKey + ?Sized,
        V: Serialize + DeserializeOwned,
        Ver: Serialize + DeserializeOwned,
    {
        let key = required_key(key)?;
        let codec = self.accessor.codec();
        let (released, _) = self
            .accessor
            .compare_and_swap(&key, |current, global| {
                let Some(current) = stored_item(current, global)? else {
                    return Ok(CasStep::Abort(false));
                };
                let mut item: LockableCachedItem<V, Ver> = decode_item(codec, current, global)?;
                if item.lock.is_none() {
                    return Ok(CasStep::Abort(true));
                }
                if !item.unlock(owner, Utc::now()) {
                    return Ok(CasStep::Abort(false));
                }
                Ok(CasStep::Commit {
                    commands: self.write_item(global, codec.encode(&item)?),
                    result: true,
                })
            })
            .await?;
        Ok(released)
    }

    /// Commands that store an encoded item and register its entry key.
    fn write_item(&self, global: &str, bytes: Vec<u8>) -> Vec<Command> {
        vec![
            Command::set_ex(global, bytes, self.accessor.config().expiration),
            Command::sadd(self.accessor.namespace().global_keys_key(), global),
        ]
    }
}

/// Bytes at an entry key that must hold a versioned item, if any.
fn stored_item<'a>(current: &'a Reply, global: &str) -> RegionCacheResult<Option<&'a [u8]>> {
    match current {
        Reply::Nil => Ok(None),
        Reply::Bulk(bytes) => Ok(Some(bytes.as_slice())),
        Reply::Error(reason) => Err(unexpected_shape(global, reason.clone())),
        other => Err(unexpected_shape(global, format!("unexpected reply {}", other))),
    }
}

fn unexpected_shape(global: &str, reason: String) -> RegionCacheError {
    InvariantError::UnexpectedShape {
        key: global.to_string(),
        reason,
    }
    .into()
}

/// Decode stored bytes that must be a versioned item.
fn decode_item<C, V, Ver>(codec: &C, bytes: &[u8], global: &str) -> RegionCacheResult<LockableCachedItem<V, Ver>>
where
    C: ValueCodec,
    V: DeserializeOwned,
    Ver: DeserializeOwned,
{
    codec
        .decode(bytes)
        .map_err(|e| unexpected_shape(global, e.to_string()))
}
