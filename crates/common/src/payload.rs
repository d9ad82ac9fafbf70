// Base64 transport encoding for opaque CRDT state blobs.
//
// Payloads are never inspected: they are carried as standard base64 in JSON
// bodies and channel frames and as raw bytes everywhere else.

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

/// Largest decoded document state the relay stores or relays over a channel.
pub const MAX_CONTENT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("payload must not be empty")]
    Empty,
}

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode(encoded: &str) -> Result<Vec<u8>, PayloadError> {
    STANDARD.decode(encoded.trim()).map_err(|error| PayloadError::InvalidBase64(error.to_string()))
}

/// Decode a payload that must carry at least one byte.
pub fn decode_non_empty(encoded: &str) -> Result<Vec<u8>, PayloadError> {
    let bytes = decode(encoded)?;
    if bytes.is_empty() {
        return Err(PayloadError::Empty);
    }
    Ok(bytes)
}
