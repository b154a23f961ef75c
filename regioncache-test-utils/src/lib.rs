//! regioncache Test Utilities
//!
//! Shared test infrastructure for the regioncache workspace:
//! - Proptest generators for region names, keys, payloads and versions
//! - Fixtures that bind regions to an in-memory store
//! - `ConflictingStore`, a transport that loses optimistic transactions on demand
//! - Custom assertions for regioncache result classes

pub use regioncache_core::{
    InvariantError, PutOutcome, RegionCacheError, RegionCacheResult, RegionConfig, RetryPolicy,
    TransportError, ValidationError,
};
pub use regioncache_region::RegionCache;
pub use regioncache_store::{Command, InMemoryStore, Reply, StoreTransport, Transaction, WatchToken};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly subscriber once. Honors `RUST_LOG`.
pub fn init_test_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("regioncache_region=debug,warn"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// ============================================================================
// CONFLICT INJECTION
// ============================================================================

/// Store wrapper that makes guarded transactions lose their race.
///
/// While armed, each `exec` carrying a watch first rewrites the last watched
/// key with its current contents, so the store sees a concurrent write and
/// aborts the transaction. Values are left as they were.
pub struct ConflictingStore {
    inner: Arc<InMemoryStore>,
    remaining: AtomicU32,
    injected: AtomicU32,
}

impl ConflictingStore {
    pub fn new(inner: Arc<InMemoryStore>, conflicts: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(conflicts),
            injected: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryStore> {
        &self.inner
    }

    /// Lose the next `conflicts` guarded transactions.
    pub fn arm(&self, conflicts: u32) {
        self.remaining.store(conflicts, Ordering::SeqCst);
    }

    /// Number of conflicts injected so far.
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn take_conflict(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn touch(&self, key: &str) -> RegionCacheResult<()> {
        match self.inner.execute(Command::get(key)).await? {
            Reply::Bulk(bytes) => {
                self.inner.execute(Command::set(key, bytes)).await?;
            }
            _ => {
                self.inner.execute(Command::set(key, Vec::new())).await?;
                self.inner.execute(Command::del(key)).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransport for ConflictingStore {
    async fn execute(&self, command: Command) -> RegionCacheResult<Reply> {
        self.inner.execute(command).await
    }

    async fn pipeline(&self, commands: Vec<Command>) -> RegionCacheResult<Vec<Reply>> {
        self.inner.pipeline(commands).await
    }

    async fn watch(&self, keys: Vec<String>) -> RegionCacheResult<WatchToken> {
        self.inner.watch(keys).await
    }

    async fn unwatch(&self, token: WatchToken) -> RegionCacheResult<()> {
        self.inner.unwatch(token).await
    }

    async fn exec(&self, transaction: Transaction) -> RegionCacheResult<Option<Vec<Reply>>> {
        let target = transaction
            .watch()
            .and_then(|w| w.keys().last().cloned());
        if let Some(key) = target {
            if self.take_conflict() {
                self.touch(&key).await?;
                self.injected.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.inner.exec(transaction).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for regioncache inputs.

    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    /// Region names valid for `KeyNamespace`.
    pub fn arb_region_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,11}"
    }

    pub fn arb_prefix() -> impl Strategy<Value = Option<String>> {
        prop::option::of("[a-z]{1,6}")
    }

    /// Non-empty logical keys, including the characters key derivation escapes.
    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_#:.\\\\-]{1,16}"
    }

    /// Distinct non-empty keys.
    pub fn arb_key_set(max: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set(arb_cache_key(), 1..=max.max(1))
            .prop_map(|keys| keys.into_iter().collect())
    }

    pub fn arb_payload() -> impl Strategy<Value = String> {
        "[ -~]{0,32}"
    }

    /// Strictly increasing versions `v1 < v2 < v3`.
    pub fn arb_version_triple() -> impl Strategy<Value = (u64, u64, u64)> {
        (0u64..1_000, 1u64..100, 1u64..100).prop_map(|(v1, d1, d2)| (v1, v1 + d1, v1 + d1 + d2))
    }

    pub fn arb_retry_policy() -> impl Strategy<Value = RetryPolicy> {
        (1u32..64, 0u64..5, 5u64..200, 1.0f32..4.0).prop_map(
            |(max_attempts, initial_ms, max_ms, backoff_multiplier)| RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(max_ms),
                backoff_multiplier,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built regions and configurations.

    use super::*;

    /// Defaults with immediate CAS retries.
    pub fn fast_config() -> RegionConfig {
        RegionConfig::default().with_cas_retry(RetryPolicy::immediate(8))
    }

    /// A region on a fresh in-memory store.
    pub fn memory_region(region: &str) -> (Arc<InMemoryStore>, RegionCache<InMemoryStore>) {
        memory_region_with(region, fast_config())
    }

    pub fn memory_region_with(
        region: &str,
        config: RegionConfig,
    ) -> (Arc<InMemoryStore>, RegionCache<InMemoryStore>) {
        let store = InMemoryStore::shared();
        let cache = RegionCache::new(region, Arc::clone(&store), config)
            .expect("fixture region should be valid");
        (store, cache)
    }

    /// Several independent handles on the same store, one per name. Repeating
    /// a name gives two clients of the same region.
    pub fn shared_regions(
        regions: &[&str],
        config: RegionConfig,
    ) -> (Arc<InMemoryStore>, Vec<RegionCache<InMemoryStore>>) {
        let store = InMemoryStore::shared();
        let caches = regions
            .iter()
            .map(|region| {
                RegionCache::new(*region, Arc::clone(&store), config.clone())
                    .expect("fixture region should be valid")
            })
            .collect();
        (store, caches)
    }

    /// A region whose next `conflicts` guarded transactions lose their race.
    pub fn conflicting_region(
        region: &str,
        conflicts: u32,
        config: RegionConfig,
    ) -> (Arc<ConflictingStore>, RegionCache<ConflictingStore>) {
        let store = Arc::new(ConflictingStore::new(InMemoryStore::shared(), conflicts));
        let cache = RegionCache::new(region, Arc::clone(&store), config)
            .expect("fixture region should be valid");
        (store, cache)
    }

    /// Current-thread runtime for driving async code inside proptest bodies.
    pub fn test_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Failed to create test runtime")
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on regioncache result classes.

    use super::*;
    use std::fmt::Debug;

    /// Assert a read returned no value.
    #[track_caller]
    pub fn assert_miss<T: Debug>(result: &RegionCacheResult<Option<T>>) {
        match result {
            Ok(None) => {}
            other => panic!("Expected a miss, got: {:?}", other),
        }
    }

    /// Assert a read returned `expected`.
    #[track_caller]
    pub fn assert_hit<T: Debug + PartialEq>(result: &RegionCacheResult<Option<T>>, expected: &T) {
        match result {
            Ok(Some(value)) => assert_eq!(value, expected, "Wrong cached value"),
            other => panic!("Expected a hit of {:?}, got: {:?}", expected, other),
        }
    }

    /// Assert a precondition violation.
    #[track_caller]
    pub fn assert_precondition<T: Debug>(result: &RegionCacheResult<T>) {
        match result {
            Err(RegionCacheError::Validation(_)) => {}
            other => panic!("Expected a precondition violation, got: {:?}", other),
        }
    }

    /// Assert a fatal invariant violation.
    #[track_caller]
    pub fn assert_fatal<T: Debug>(result: &RegionCacheResult<T>) {
        match result {
            Err(e) if e.is_fatal() => {}
            other => panic!("Expected an invariant violation, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_transport_error<T: Debug>(result: &RegionCacheResult<T>) {
        match result {
            Err(RegionCacheError::Transport(_)) => {}
            other => panic!("Expected a transport error, got: {:?}", other),
        }
    }
}
