//! regioncache Core - shared types for the generation-partitioned cache protocol
//!
//! Everything here is free of I/O: error taxonomy, configuration, the value
//! codec seam, logical keys, and the version-stamped item stored by
//! versioned puts.

pub mod codec;
pub mod config;
pub mod error;
pub mod item;
pub mod key;

pub use codec::{JsonCodec, ValueCodec};
pub use config::{property, RegionConfig, RetryPolicy};
pub use error::{
    CodecError, ConfigError, InvariantError, LockError, RegionCacheError, RegionCacheResult,
    TransportError, ValidationError,
};
pub use item::{LockMarker, LockableCachedItem, NaturalOrder, PutOutcome, StoredValue, VersionComparator};
pub use key::CacheKey;
