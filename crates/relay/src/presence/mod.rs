// Per-document presence channels.
//
// Tracks which authenticated users are connected to each document and relays
// whispers between their connections. Nothing here is persisted; delivery is
// best effort and at most once.

use std::{collections::HashMap, sync::Arc};

use draftsync_common::protocol::channel::{PresenceMember, ServerFrame, Whisper};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{ErrorCode, RelayError},
    sync::service::SyncError,
};

pub type ConnectionId = Uuid;
pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no access to this document channel")]
    AccessDenied,
    #[error("document does not exist")]
    DocumentNotFound,
    #[error("connection is not joined to the document channel")]
    NotJoined,
    #[error("view-only members cannot send updates")]
    ReadOnly,
    #[error("restore whispers are only issued by the relay")]
    RestoreFromClient,
    #[error("invalid channel frame: {0}")]
    InvalidFrame(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ChannelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AccessDenied | Self::ReadOnly => ErrorCode::AuthForbidden,
            Self::DocumentNotFound => ErrorCode::NotFound,
            Self::NotJoined | Self::RestoreFromClient | Self::InvalidFrame(_) => {
                ErrorCode::ValidationFailed
            }
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => self.code().default_message().to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_frame(&self) -> ServerFrame {
        let code = self.code();
        ServerFrame::Error {
            code: code.as_str().to_string(),
            message: self.client_message(),
            retryable: code.retryable(),
        }
    }

    /// HTTP rejection for an upgrade that never reached the hub.
    pub fn to_relay_error(&self) -> RelayError {
        RelayError::new(self.code(), self.client_message())
    }
}

impl From<SyncError> for ChannelError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::AccessDenied => Self::AccessDenied,
            SyncError::NotFound => Self::DocumentNotFound,
            SyncError::Internal(error) => Self::Internal(error),
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

/// Identity and rights of a connection admitted to a document channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAccess {
    pub member: PresenceMember,
    pub can_edit: bool,
}

struct Connection {
    member: PresenceMember,
    outbound: FrameSender,
}

#[derive(Default)]
struct Channel {
    connections: HashMap<ConnectionId, Connection>,
}

impl Channel {
    fn has_user(&self, user_id: Uuid) -> bool {
        self.connections.values().any(|connection| connection.member.id == user_id)
    }

    /// Roster deduplicated by user id, ordered by name then id.
    fn roster(&self) -> Vec<PresenceMember> {
        let mut by_user: HashMap<Uuid, PresenceMember> = HashMap::new();
        for connection in self.connections.values() {
            by_user.entry(connection.member.id).or_insert_with(|| connection.member.clone());
        }
        let mut members: Vec<PresenceMember> = by_user.into_values().collect();
        members.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        members
    }

    fn send_except(&self, exclude: Option<ConnectionId>, frame: &ServerFrame) -> usize {
        let mut sent = 0;
        for (connection_id, connection) in &self.connections {
            if Some(*connection_id) == exclude {
                continue;
            }
            if connection.outbound.send(frame.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

/// Registry of live document channels.
///
/// Callers are responsible for the access check before [`PresenceHub::join`].
#[derive(Clone, Default)]
pub struct PresenceHub {
    channels: Arc<RwLock<HashMap<Uuid, Channel>>>,
}

impl PresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection. The new connection receives `here`; other
    /// connections receive `joining` unless the user was already present.
    pub async fn join(
        &self,
        document_id: Uuid,
        member: PresenceMember,
        outbound: FrameSender,
    ) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        let mut channels = self.channels.write().await;
        let channel = channels.entry(document_id).or_default();

        let already_present = channel.has_user(member.id);
        if !already_present {
            channel.send_except(None, &ServerFrame::Joining { member: member.clone() });
        }

        channel.connections.insert(connection_id, Connection { member, outbound: outbound.clone() });
        if outbound.send(ServerFrame::Here { document_id, members: channel.roster() }).is_err() {
            debug!(document_id = %document_id, "connection closed before its roster was sent");
        }

        debug!(
            document_id = %document_id,
            connection_id = %connection_id,
            connections = channel.connections.len(),
            "presence member joined"
        );
        connection_id
    }

    /// Remove a connection. `leaving` is sent only when the user's last connection goes.
    pub async fn leave(&self, document_id: Uuid, connection_id: ConnectionId) {
        let mut channels = self.channels.write().await;
        let Some(channel) = channels.get_mut(&document_id) else {
            return;
        };
        let Some(removed) = channel.connections.remove(&connection_id) else {
            return;
        };

        if !channel.has_user(removed.member.id) {
            channel.send_except(None, &ServerFrame::Leaving { member: removed.member });
        }
        if channel.connections.is_empty() {
            channels.remove(&document_id);
        }
        debug!(document_id = %document_id, connection_id = %connection_id, "presence member left");
    }

    /// Relay a whisper to every other connection on the document, stamped with
    /// the sending connection's identity. Returns the number of recipients.
    /// Only `update` whispers are accepted; `restore` goes through [`PresenceHub::publish`].
    pub async fn whisper(
        &self,
        document_id: Uuid,
        from: ConnectionId,
        whisper: Whisper,
    ) -> Result<usize, ChannelError> {
        if matches!(whisper, Whisper::Restore { .. }) {
            return Err(ChannelError::RestoreFromClient);
        }
        let channels = self.channels.read().await;
        let channel = channels.get(&document_id).ok_or(ChannelError::NotJoined)?;
        let sender = channel.connections.get(&from).ok_or(ChannelError::NotJoined)?;

        let frame = ServerFrame::Whisper { whisper: whisper.stamped(&sender.member) };
        Ok(channel.send_except(Some(from), &frame))
    }

    /// Server-originated whisper delivered to every connection on the document.
    pub async fn publish(&self, document_id: Uuid, whisper: Whisper) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(&document_id)
            .map(|channel| channel.send_except(None, &ServerFrame::Whisper { whisper }))
            .unwrap_or(0)
    }

    pub async fn members(&self, document_id: Uuid) -> Vec<PresenceMember> {
        self.channels.read().await.get(&document_id).map(Channel::roster).unwrap_or_default()
    }

    pub async fn connection_count(&self, document_id: Uuid) -> usize {
        self.channels
            .read()
            .await
            .get(&document_id)
            .map_or(0, |channel| channel.connections.len())
    }
}
