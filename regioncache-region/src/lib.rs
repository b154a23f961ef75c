//! regioncache Region - generation-partitioned cache regions
//!
//! A region keeps many concurrent clients agreeing on which entries are
//! current without any in-process coordination. Each entry key embeds the
//! region's generation; `clear` advances the generation and the old entries
//! become unreachable in O(1). Reads and writes check the generation in the
//! same transaction as the keyed command and rerun on drift.
//!
//! On top of that sit version-aware writes (`VersionedPutEngine`, an
//! optimistic compare-and-swap under `WATCH`) and advisory per-key locks
//! (`LockCoordinator`). `RegionCache` bundles all three behind one handle.

pub mod accessor;
pub mod lock;
pub mod namespace;
pub mod region;
pub mod sync;
pub mod versioned;

pub use accessor::CacheAccessor;
pub use lock::{LockCoordinator, LockToken};
pub use namespace::{KeyNamespace, GARBAGE_LIST_KEY, LOCK_TAGS, UNINITIALIZED_GENERATION};
pub use region::{RegionCache, RegionCacheOps};
pub use sync::GenerationSync;
pub use versioned::VersionedPutEngine;

pub use regioncache_core::{
    CacheKey, JsonCodec, LockableCachedItem, NaturalOrder, PutOutcome, RegionCacheError,
    RegionCacheResult, RegionConfig, RetryPolicy, ValueCodec, VersionComparator,
};
pub use regioncache_store::{InMemoryStore, StoreTransport};
