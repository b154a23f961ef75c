//! The store transport seam.

use async_trait::async_trait;
use regioncache_core::RegionCacheResult;
use std::sync::Arc;
use uuid::Uuid;

use crate::command::{Command, Reply};

/// Handle for keys watched ahead of a transaction.
///
/// Stores bind a watch to whatever owns the optimistic session (a dedicated
/// connection for networked stores). The token is consumed by
/// [`StoreTransport::exec`] or [`StoreTransport::unwatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchToken {
    id: Uuid,
    keys: Vec<String>,
}

impl WatchToken {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            keys,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// Commands queued between `MULTI` and `EXEC`, optionally guarded by a watch.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    watch: Option<WatchToken>,
    commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the transaction if any of the token's keys change before exec.
    pub fn guarded_by(mut self, watch: WatchToken) -> Self {
        self.watch = Some(watch);
        self
    }

    pub fn queue(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn watch(&self) -> Option<&WatchToken> {
        self.watch.as_ref()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn into_parts(self) -> (Option<WatchToken>, Vec<Command>) {
        (self.watch, self.commands)
    }
}

/// Executes commands and optimistic transactions against the remote store.
///
/// Implementations must support many concurrent independent transactions.
#[async_trait]
pub trait StoreTransport: Send + Sync {
    /// Run one command. Error replies surface as `TransportError::CommandFailed`.
    async fn execute(&self, command: Command) -> RegionCacheResult<Reply>;

    /// Send several commands in one round trip. Not atomic; per-command
    /// failures come back as [`Reply::Error`].
    async fn pipeline(&self, commands: Vec<Command>) -> RegionCacheResult<Vec<Reply>>;

    /// `WATCH key...`
    async fn watch(&self, keys: Vec<String>) -> RegionCacheResult<WatchToken>;

    /// `UNWATCH`
    async fn unwatch(&self, token: WatchToken) -> RegionCacheResult<()>;

    /// `MULTI ... EXEC`.
    ///
    /// Returns `None` when a watched key changed and nothing was applied.
    /// Otherwise every queued command ran atomically; failures of
    /// individual commands come back as [`Reply::Error`].
    async fn exec(&self, transaction: Transaction) -> RegionCacheResult<Option<Vec<Reply>>>;
}

#[async_trait]
impl<T: StoreTransport + ?Sized> StoreTransport for Arc<T> {
    async fn execute(&self, command: Command) -> RegionCacheResult<Reply> {
        (**self).execute(command).await
    }

    async fn pipeline(&self, commands: Vec<Command>) -> RegionCacheResult<Vec<Reply>> {
        (**self).pipeline(commands).await
    }

    async fn watch(&self, keys: Vec<String>) -> RegionCacheResult<WatchToken> {
        (**self).watch(keys).await
    }

    async fn unwatch(&self, token: WatchToken) -> RegionCacheResult<()> {
        (**self).unwatch(token).await
    }

    async fn exec(&self, transaction: Transaction) -> RegionCacheResult<Option<Vec<Reply>>> {
        (**self).exec(transaction).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_builder() {
        let token = WatchToken::new(vec!["gen".to_string()]);
        let txn = Transaction::new()
            .guarded_by(token.clone())
            .queue(Command::get("gen"))
            .queue(Command::incr("gen"));

        assert_eq!(txn.len(), 2);
        assert_eq!(txn.watch(), Some(&token));
        let (watch, commands) = txn.into_parts();
        assert_eq!(watch.map(|w| w.id()), Some(token.id()));
        assert_eq!(commands[1].name(), "INCR");
    }

    #[test]
    fn test_watch_tokens_are_unique() {
        let a = WatchToken::new(vec!["k".to_string()]);
        let b = WatchToken::new(vec!["k".to_string()]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.keys(), b.keys());
    }
}
