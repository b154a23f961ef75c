//! regioncache Store - the transport seam between regions and the remote store
//!
//! Regions speak a small Redis-shaped command set: string get/set with
//! expiry, counters, rename, sets, lists, and optimistic transactions
//! guarded by `WATCH`. [`StoreTransport`] is the seam; [`InMemoryStore`]
//! implements it in-process.

pub mod command;
pub mod memory;
pub mod transport;

pub use command::{Command, Reply, SetCondition};
pub use memory::InMemoryStore;
pub use transport::{StoreTransport, Transaction, WatchToken};
