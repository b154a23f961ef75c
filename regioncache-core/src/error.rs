//! Error types for regioncache operations

use std::time::Duration;
use thiserror::Error;

/// Precondition violations. Reported before any store access.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Null value not allowed for key {key}")]
    NullValue { key: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Failures talking to the remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Store unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Command {command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    #[error("Operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

/// Consistency failures. These are never retried and never masked as misses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantError {
    #[error("Unexpected value shape at {key}: {reason}")]
    UnexpectedShape { key: String, reason: String },

    #[error("Generation of region {region} kept moving after {attempts} attempts")]
    GenerationRetriesExhausted { region: String, attempts: u32 },

    #[error("Compare-and-swap on {key} lost to concurrent writers {attempts} times")]
    ContentionRetriesExhausted { key: String, attempts: u32 },
}

/// Value collaborator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Encode failed: {reason}")]
    Encode { reason: String },

    #[error("Decode failed: {reason}")]
    Decode { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Advisory lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock on {key} is not held by this owner")]
    NotOwner { key: String },
}

/// Master error type for all regioncache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegionCacheError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

impl RegionCacheError {
    /// Invariant violations leave the region in a state the protocol cannot
    /// reason about; callers should stop using the region.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegionCacheError::Invariant(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, RegionCacheError::Transport(_))
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, RegionCacheError::Validation(_))
    }
}

/// Result type alias for regioncache operations.
pub type RegionCacheResult<T> = Result<T, RegionCacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_required_field() {
        let err = ValidationError::RequiredFieldMissing {
            field: "key".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Required field missing"));
        assert!(msg.contains("key"));
    }

    #[test]
    fn test_transport_error_display_timeout() {
        let err = TransportError::Timeout {
            operation: "get".to_string(),
            after: Duration::from_millis(250),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("get"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_invariant_error_display_unexpected_shape() {
        let err = InvariantError::UnexpectedShape {
            key: "users:3:42".to_string(),
            reason: "plain entry".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("users:3:42"));
        assert!(msg.contains("plain entry"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "expiration".to_string(),
            value: "0s".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("expiration"));
        assert!(msg.contains("0s"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_error_classification() {
        let fatal = RegionCacheError::from(InvariantError::GenerationRetriesExhausted {
            region: "users".to_string(),
            attempts: 16,
        });
        assert!(fatal.is_fatal());
        assert!(!fatal.is_transport());

        let transport = RegionCacheError::from(TransportError::Unreachable {
            reason: "connection refused".to_string(),
        });
        assert!(transport.is_transport());
        assert!(!transport.is_fatal());

        let precondition = RegionCacheError::from(ValidationError::NullValue {
            key: "k".to_string(),
        });
        assert!(precondition.is_precondition());
    }

    #[test]
    fn test_region_cache_error_from_variants() {
        let codec = RegionCacheError::from(CodecError::Decode {
            reason: "eof".to_string(),
        });
        assert!(matches!(codec, RegionCacheError::Codec(_)));

        let config = RegionCacheError::from(ConfigError::IncompatibleOptions {
            option_a: "no_clear".to_string(),
            option_b: "generation_retry_limit".to_string(),
        });
        assert!(matches!(config, RegionCacheError::Config(_)));

        let lock = RegionCacheError::from(LockError::NotOwner {
            key: "k".to_string(),
        });
        assert!(matches!(lock, RegionCacheError::Lock(_)));
    }
}
