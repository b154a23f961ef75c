//! Value serialization collaborator.
//!
//! The protocol never looks inside cached payloads; it hands values to a
//! [`ValueCodec`] and stores whatever bytes come back.

use crate::CodecError;
use serde::{de::DeserializeOwned, Serialize};

/// Converts cached values to and from store bytes.
///
/// Implementations must be self-describing: the read path decodes an
/// untagged union of "versioned item" and "plain value".
pub trait ValueCodec: Send + Sync {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;

    /// Whether `bytes` is the encoding of a null value.
    fn is_null(&self, bytes: &[u8]) -> bool;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            reason: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            reason: e.to_string(),
        })
    }

    fn is_null(&self, bytes: &[u8]) -> bool {
        bytes == b"null"
    }
}
