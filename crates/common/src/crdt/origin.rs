use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Where a mutation applied to a local replica came from.
///
/// Only `Local` mutations are whispered to peers and counted towards autosave.
/// Re-broadcasting a `Remote` mutation would bounce it between clients forever.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationOrigin {
    Local,
    Remote,
}

impl MutationOrigin {
    /// Single-byte encoding used as the CRDT transaction origin.
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Remote => 1,
        }
    }

    pub fn from_byte(value: u8) -> Result<Self, OriginCodecError> {
        match value {
            0 => Ok(Self::Local),
            1 => Ok(Self::Remote),
            _ => Err(OriginCodecError::UnknownOrigin(value)),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OriginCodecError> {
        match bytes {
            [value] => Self::from_byte(*value),
            _ => Err(OriginCodecError::LengthMismatch { actual: bytes.len() }),
        }
    }

    pub const fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }

    /// Whether a mutation with this origin should be whispered and scheduled for save.
    pub const fn propagates(self) -> bool {
        self.is_local()
    }
}

impl fmt::Display for MutationOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginCodecError {
    #[error("unknown mutation origin byte {0}")]
    UnknownOrigin(u8),
    #[error("origin payload must be exactly 1 byte, got {actual}")]
    LengthMismatch { actual: usize },
}
