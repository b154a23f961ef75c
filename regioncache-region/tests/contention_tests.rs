//! Contention and Concurrency Tests
//!
//! **Property 6: Compare-and-Swap Retries**
//! A versioned put that loses its race re-reads and retries, and gives up
//! with a fatal error once the retry policy is exhausted.
//!
//! **Property 7: Concurrent Versioned Writers**
//! Whatever the interleaving, the highest version wins.
//!
//! **Property 8: Generation Drift**
//! A client holding a stale generation follows another client's clear.

use regioncache_region::{NaturalOrder, PutOutcome, RegionCacheError};
use regioncache_test_utils::{
    assertions::*, fixtures, init_test_tracing, InvariantError, RetryPolicy,
};
use std::time::Duration;

#[tokio::test]
async fn test_versioned_put_retries_after_conflicts() {
    init_test_tracing();
    let (store, cache) = fixtures::conflicting_region("cas", 0, fixtures::fast_config());
    cache
        .versioned_put("k", "a", 1u64, &NaturalOrder)
        .await
        .expect("seed");

    store.arm(3);
    let outcome = cache
        .versioned_put("k", "b", 2u64, &NaturalOrder)
        .await
        .expect("put should survive three conflicts");
    assert_eq!(outcome, PutOutcome::Updated);
    assert_eq!(store.injected(), 3);
    assert_hit(&cache.get("k").await, &"b".to_string());
}

#[tokio::test]
async fn test_versioned_put_gives_up_after_policy() {
    let config = fixtures::fast_config().with_cas_retry(RetryPolicy::immediate(4));
    let (store, cache) = fixtures::conflicting_region("cas", 100, config);

    let result = cache.versioned_put("k", "a", 1u64, &NaturalOrder).await;
    assert_fatal(&result);
    assert!(matches!(
        result,
        Err(RegionCacheError::Invariant(InvariantError::ContentionRetriesExhausted { attempts: 4, .. }))
    ));
    assert_eq!(store.injected(), 4);
    assert_eq!(store.inner().open_watches().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_conflict_backoff_is_applied() {
    let policy = RetryPolicy {
        max_attempts: 8,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        backoff_multiplier: 2.0,
    };
    let config = fixtures::fast_config().with_cas_retry(policy);
    let (_store, cache) = fixtures::conflicting_region("cas", 3, config);

    let started = tokio::time::Instant::now();
    cache
        .versioned_put("k", "a", 1u64, &NaturalOrder)
        .await
        .expect("put");
    // 10 + 20 + 40 ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(70));
}

#[tokio::test]
async fn test_clear_retries_after_conflict() {
    let (store, cache) = fixtures::conflicting_region("clears", 2, fixtures::fast_config());
    cache.put("k", &1).await.expect("put");
    cache.clear().await.expect("clear should survive conflicts");
    assert_eq!(store.injected(), 2);
    assert_eq!(cache.namespace().generation(), 1);
    assert_miss(&cache.get::<_, i32>("k").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_versioned_writers_highest_wins() {
    let (_store, caches) = fixtures::shared_regions(
        &["race", "race", "race", "race"],
        fixtures::fast_config().with_cas_retry(RetryPolicy::default()),
    );

    let mut handles = Vec::new();
    for (writer, cache) in caches.iter().cloned().enumerate() {
        handles.push(tokio::spawn(async move {
            for round in 0..10u64 {
                let version = round * 4 + writer as u64;
                cache
                    .versioned_put("k", version, version, &NaturalOrder)
                    .await
                    .expect("versioned put");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("writer task");
    }

    let item = caches[0]
        .get_item::<_, u64, u64>("k")
        .await
        .expect("get item")
        .expect("item exists");
    assert_eq!(item.version, 39);
    assert_eq!(item.value, 39);
}

#[tokio::test]
async fn test_stale_client_follows_clear() {
    let (_store, caches) = fixtures::shared_regions(&["users", "users"], fixtures::fast_config());
    let (writer, reader) = (&caches[0], &caches[1]);

    writer.put("alice", &"v1").await.expect("put");
    assert_hit(&reader.get("alice").await, &"v1".to_string());

    writer.clear().await.expect("clear");
    assert_eq!(reader.namespace().generation(), 0);
    assert_miss(&reader.get::<_, String>("alice").await);
    assert_eq!(reader.namespace().generation(), 1);

    // a put from the stale client lands in the new generation
    writer.clear().await.expect("clear");
    reader.put("alice", &"v2").await.expect("put");
    assert_eq!(reader.namespace().generation(), 2);
    assert_hit(&writer.get("alice").await, &"v2".to_string());
}

#[tokio::test]
async fn test_owner_checked_unlock_across_clients() {
    let config = fixtures::fast_config().with_verify_lock_owner(true);
    let (_store, caches) = fixtures::shared_regions(&["jobs", "jobs"], config);

    let token = caches[0].try_lock("job-1").await.expect("lock").expect("acquired");
    assert!(caches[1].try_lock("job-1").await.expect("lock").is_none());

    caches[1].unlock("job-1").await.expect("unconditional unlock");
    let stolen = caches[1].try_lock("job-1").await.expect("lock").expect("acquired");

    let result = caches[0].unlock_owned(token).await;
    assert!(matches!(result, Err(RegionCacheError::Lock(_))));
    caches[1].unlock_owned(stolen).await.expect("owner unlock");
}

#[tokio::test]
async fn test_lock_follows_clear_from_another_client() {
    let (_store, caches) = fixtures::shared_regions(&["r", "r"], fixtures::fast_config());
    let (stale, fresh) = (&caches[0], &caches[1]);

    stale.put("warm", &1).await.expect("put");
    fresh.clear().await.expect("clear");
    assert_eq!(stale.namespace().generation(), 0);

    assert!(stale.lock("k").await.expect("lock"));
    assert_eq!(stale.namespace().generation(), 1);
    assert!(!fresh.lock("k").await.expect("lock"));
}

#[tokio::test]
async fn test_unlock_from_stale_client_releases_current_lock() {
    let (_store, caches) = fixtures::shared_regions(&["r", "r"], fixtures::fast_config());
    let (stale, fresh) = (&caches[0], &caches[1]);

    stale.put("warm", &1).await.expect("put");
    fresh.clear().await.expect("clear");
    assert!(fresh.lock("k").await.expect("lock"));

    stale.unlock("k").await.expect("unlock");
    assert_eq!(stale.namespace().generation(), 1);
    assert!(fresh.lock("k").await.expect("lock after release"));
}
