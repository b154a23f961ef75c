//! Reconciling the local generation with the store.

use std::future::Future;
use std::sync::Arc;

use regioncache_core::{InvariantError, RegionCacheResult, TransportError};
use regioncache_store::{Command, Reply, StoreTransport, Transaction};
use tracing::{debug, warn};

use crate::namespace::KeyNamespace;

/// Keeps a region's cached generation in step with the authoritative counter
/// and drives the generation-checked retry loop.
pub struct GenerationSync<T> {
    namespace: Arc<KeyNamespace>,
    transport: Arc<T>,
    retry_limit: u32,
}

impl<T> Clone for GenerationSync<T> {
    fn clone(&self) -> Self {
        Self {
            namespace: Arc::clone(&self.namespace),
            transport: Arc::clone(&self.transport),
            retry_limit: self.retry_limit,
        }
    }
}

impl<T: StoreTransport> GenerationSync<T> {
    pub fn new(namespace: Arc<KeyNamespace>, transport: Arc<T>, retry_limit: u32) -> Self {
        Self {
            namespace,
            transport,
            retry_limit: retry_limit.max(1),
        }
    }

    /// Fetch the authoritative generation if the local one is uninitialized.
    /// Returns the local generation.
    pub async fn ensure_synced(&self) -> RegionCacheResult<i64> {
        if self.namespace.is_synced() {
            return Ok(self.namespace.generation());
        }
        let generation = self.fetch().await?;
        self.namespace.set_generation(generation);
        debug!(
            region = self.namespace.region(),
            generation, "synced region generation"
        );
        Ok(generation)
    }

    /// Read the authoritative generation. An absent counter is generation 0.
    pub async fn fetch(&self) -> RegionCacheResult<i64> {
        self.transport
            .execute(Command::get(self.namespace.generation_key()))
            .await
            .and_then(|reply| reply.into_counter("GET"))
            .inspect_err(|e| {
                warn!(region = self.namespace.region(), error = %e, "could not read generation")
            })
    }

    /// Adopt `observed` as the local generation. Returns true on drift.
    pub fn reconcile(&self, observed: i64) -> bool {
        let local = self.namespace.generation();
        if observed == local {
            return false;
        }
        debug!(
            region = self.namespace.region(),
            local, observed, "generation drift detected; correcting local generation"
        );
        self.namespace.set_generation(observed);
        true
    }

    /// Run `attempt` under the generation-checked retry loop.
    ///
    /// `attempt` receives the generation to derive keys from and returns the
    /// authoritative generation it observed alongside its result. A mismatch
    /// corrects the local generation and reruns the attempt against the
    /// re-derived keys.
    pub async fn run_checked<R, F, Fut>(&self, operation: &str, mut attempt: F) -> RegionCacheResult<R>
    where
        F: FnMut(i64) -> Fut,
        Fut: Future<Output = RegionCacheResult<(i64, R)>>,
    {
        for _ in 0..self.retry_limit {
            let generation = self.ensure_synced().await?;
            let (observed, result) = attempt(generation).await?;
            if !self.reconcile(observed) {
                return Ok(result);
            }
            debug!(region = self.namespace.region(), operation, "retrying after generation change");
        }
        Err(InvariantError::GenerationRetriesExhausted {
            region: self.namespace.region().to_string(),
            attempts: self.retry_limit,
        }
        .into())
    }

    pub fn namespace(&self) -> &Arc<KeyNamespace> {
        &self.namespace
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }
}

/// Commit a transaction that is not guarded by a watch.
pub(crate) async fn commit<T: StoreTransport + ?Sized>(
    transport: &T,
    transaction: Transaction,
) -> RegionCacheResult<std::vec::IntoIter<Reply>> {
    match transport.exec(transaction).await? {
        Some(replies) => Ok(replies.into_iter()),
        None => Err(TransportError::UnexpectedReply {
            command: "EXEC".to_string(),
            reply: Reply::Nil.to_string(),
        }
        .into()),
    }
}

/// Next reply of a transaction or pipeline.
pub(crate) fn next_reply(
    replies: &mut impl Iterator<Item = Reply>,
    command: &str,
) -> RegionCacheResult<Reply> {
    replies.next().ok_or_else(|| {
        TransportError::UnexpectedReply {
            command: command.to_string(),
            reply: "missing reply".to_string(),
        }
        .into()
    })
}
