// Frame types for the per-document presence channel (draftsync-channel.v1).

use crate::payload::{self, PayloadError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CHANNEL_PROTOCOL_VERSION: &str = "draftsync-channel.v1";

/// A user currently joined to a document channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PresenceMember {
    pub id: Uuid,
    pub name: String,
}

/// Ephemeral peer message relayed between members. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Whisper {
    /// Full encoded replica state after a local edit. Receivers merge it.
    #[serde(rename_all = "camelCase")]
    Update { content: String, user_id: Uuid, user_name: String },

    /// State of a restored version. Receivers replace their replica with it.
    #[serde(rename_all = "camelCase")]
    Restore { content: String, version_number: i64, user_id: Uuid, user_name: String },
}

impl Whisper {
    pub fn update(content: &[u8], sender: &PresenceMember) -> Self {
        Self::Update {
            content: payload::encode(content),
            user_id: sender.id,
            user_name: sender.name.clone(),
        }
    }

    pub fn restore(content: &[u8], version_number: i64, sender: &PresenceMember) -> Self {
        Self::Restore {
            content: payload::encode(content),
            version_number,
            user_id: sender.id,
            user_name: sender.name.clone(),
        }
    }

    pub fn sender_id(&self) -> Uuid {
        match self {
            Self::Update { user_id, .. } | Self::Restore { user_id, .. } => *user_id,
        }
    }

    pub fn sender(&self) -> PresenceMember {
        match self {
            Self::Update { user_id, user_name, .. } | Self::Restore { user_id, user_name, .. } => {
                PresenceMember { id: *user_id, name: user_name.clone() }
            }
        }
    }

    /// Self-echo check: true when this whisper was sent by `user_id`.
    pub fn is_from(&self, user_id: Uuid) -> bool {
        self.sender_id() == user_id
    }

    /// Overwrite the claimed sender with the authenticated identity of the connection.
    pub fn stamped(self, sender: &PresenceMember) -> Self {
        match self {
            Self::Update { content, .. } => {
                Self::Update { content, user_id: sender.id, user_name: sender.name.clone() }
            }
            Self::Restore { content, version_number, .. } => Self::Restore {
                content,
                version_number,
                user_id: sender.id,
                user_name: sender.name.clone(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::Restore { .. } => "restore",
        }
    }

    pub fn content_b64(&self) -> &str {
        match self {
            Self::Update { content, .. } | Self::Restore { content, .. } => content,
        }
    }

    pub fn decode_content(&self) -> Result<Vec<u8>, PayloadError> {
        payload::decode_non_empty(self.content_b64())
    }
}

/// Server -> client frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent once to a newly joined connection: everyone currently present, including itself.
    Here { document_id: Uuid, members: Vec<PresenceMember> },

    /// A user joined the channel (first connection for that user).
    Joining { member: PresenceMember },

    /// A user left the channel (last connection for that user closed).
    Leaving { member: PresenceMember },

    Whisper { whisper: Whisper },

    Error { code: String, message: String, retryable: bool },
}

/// Client -> server frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Whisper { whisper: Whisper },
}
