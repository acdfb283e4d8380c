//! Codec seam between the bus and the broker wire format.

use std::fmt;

use crate::event::Event;

/// Error when encoding or decoding an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecError {
    pub message: String,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "codec error: {}", self.message)
    }
}

impl std::error::Error for CodecError {}

/// Turns an event into bytes and back.
///
/// The concrete codec is an external collaborator; the bus only requires
/// that `from_bytes(to_bytes(e)) == e`.
pub trait EventSerializer: Send + Sync {
    fn to_bytes(&self, event: &Event) -> Result<Vec<u8>, CodecError>;
    fn from_bytes(&self, bytes: &[u8]) -> Result<Event, CodecError>;
}

/// Compact binary codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct BitcodeSerializer;

impl EventSerializer for BitcodeSerializer {
    fn to_bytes(&self, event: &Event) -> Result<Vec<u8>, CodecError> {
        bitcode::serialize(event).map_err(|e| CodecError {
            message: e.to_string(),
        })
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Event, CodecError> {
        bitcode::deserialize(bytes).map_err(|e| CodecError {
            message: e.to_string(),
        })
    }
}

/// Human-readable JSON codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl EventSerializer for JsonSerializer {
    fn to_bytes(&self, event: &Event) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(event).map_err(|e| CodecError {
            message: e.to_string(),
        })
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Event, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError {
            message: e.to_string(),
        })
    }
}
