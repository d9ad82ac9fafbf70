// One user's live editing session on one document.
//
// Owns the replica, the connection state machine and the autosave scheduler,
// and executes what they decide against the relay. Local mutations are
// whispered and scheduled for save; remote whispers are merged (or, for
// restores, replace the replica) and never propagate further.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use draftsync_common::payload::{self, PayloadError};
use draftsync_common::protocol::channel::{ClientFrame, PresenceMember, ServerFrame, Whisper};
use draftsync_common::types::{SaveRequest, SaveResponse};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::autosave::{AutosaveScheduler, AutosaveStats, FlushTicket};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::reconnect::{Command, ConnectionEvent, ConnectionMachine, ConnectionState};
use crate::replica::{Mutation, Replica, ReplicaError};
use crate::transport::{ChannelConnector, ChannelLink, SyncApi, TransportError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Inputs accepted by [`DocumentSession::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Insert { index: u32, chunk: String },
    Remove { index: u32, count: u32 },
    /// An update produced by a local editor binding.
    ApplyUpdate(Vec<u8>),
    Restore { version_number: i64 },
    /// Retry the presence channel after automatic retries gave up.
    Reconnect,
    Close,
}

#[derive(Debug)]
struct SaveOutcome {
    ticket: FlushTicket,
    result: Result<SaveResponse, TransportError>,
}

pub struct DocumentSession {
    document_id: Uuid,
    identity: PresenceMember,
    replica: Replica,
    connection: ConnectionMachine,
    autosave: AutosaveScheduler,
    api: Arc<dyn SyncApi>,
    connector: Arc<dyn ChannelConnector>,
    clock: Arc<dyn Clock>,
    link: Option<ChannelLink>,
    roster: BTreeMap<Uuid, PresenceMember>,
    manual_retry_reason: Option<String>,
    latest_version: i64,
    saves_tx: mpsc::UnboundedSender<SaveOutcome>,
    saves_rx: mpsc::UnboundedReceiver<SaveOutcome>,
}

impl DocumentSession {
    pub fn new(
        config: &ClientConfig,
        document_id: Uuid,
        api: Arc<dyn SyncApi>,
        connector: Arc<dyn ChannelConnector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (saves_tx, saves_rx) = mpsc::unbounded_channel();
        Self {
            document_id,
            identity: config.identity.clone(),
            replica: Replica::new(),
            connection: ConnectionMachine::new(config.reconnect.clone()),
            autosave: AutosaveScheduler::new(config.autosave.clone()),
            api,
            connector,
            clock,
            link: None,
            roster: BTreeMap::new(),
            manual_retry_reason: None,
            latest_version: 0,
            saves_tx,
            saves_rx,
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn text(&self) -> String {
        self.replica.text()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionMachine {
        &self.connection
    }

    /// Set once automatic reconnects are exhausted; cleared by a successful join.
    pub fn manual_retry_reason(&self) -> Option<&str> {
        self.manual_retry_reason.as_deref()
    }

    pub fn roster(&self) -> Vec<PresenceMember> {
        self.roster.values().cloned().collect()
    }

    pub fn autosave(&self) -> &AutosaveScheduler {
        &self.autosave
    }

    pub fn autosave_stats(&self) -> AutosaveStats {
        self.autosave.stats()
    }

    /// Latest version number reported when the document was loaded.
    pub fn latest_version(&self) -> i64 {
        self.latest_version
    }

    /// Load the stored content, then join the presence channel.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        let loaded = self
            .api
            .load_document(self.document_id)
            .instrument(info_span!("client.session.load", document_id = %self.document_id))
            .await?;
        let content = payload::decode(&loaded.content)?;
        self.replica.replace_with(&content)?;
        self.latest_version = loaded.version_number;
        info!(
            document_id = %self.document_id,
            version_number = loaded.version_number,
            content_bytes = content.len(),
            "document loaded"
        );

        self.connect().await;
        Ok(())
    }

    pub async fn connect(&mut self) {
        self.drive(ConnectionEvent::Connect).await;
    }

    /// Manual retry: resets the attempt counter and joins immediately.
    pub async fn reconnect(&mut self) {
        self.drive(ConnectionEvent::ManualReconnect).await;
    }

    pub async fn insert_text(&mut self, index: u32, chunk: &str) -> Result<(), SessionError> {
        let mutation = self.replica.insert_text(index, chunk)?;
        self.after_mutation(mutation).await;
        Ok(())
    }

    pub async fn remove_text(&mut self, index: u32, count: u32) -> Result<(), SessionError> {
        let mutation = self.replica.remove_text(index, count)?;
        self.after_mutation(mutation).await;
        Ok(())
    }

    pub async fn apply_local_update(&mut self, update: &[u8]) -> Result<(), SessionError> {
        let mutation = self.replica.apply_local_update(update)?;
        self.after_mutation(mutation).await;
        Ok(())
    }

    /// Restore a stored version and replace the local replica with it.
    ///
    /// The relay notifies the other members; this session applies the
    /// response directly because its own whisper is suppressed as self-echo.
    pub async fn restore_version(&mut self, version_number: i64) -> Result<(), SessionError> {
        let restored = self
            .api
            .restore_version(self.document_id, version_number)
            .instrument(info_span!(
                "client.session.restore",
                document_id = %self.document_id,
                version_number
            ))
            .await?;
        let content = payload::decode(&restored.content)?;
        self.replica.replace_with(&content)?;
        info!(document_id = %self.document_id, version_number, "restored version applied");
        Ok(())
    }

    pub async fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Here { members, .. } => {
                self.roster = members.into_iter().map(|member| (member.id, member)).collect();
                self.manual_retry_reason = None;
                self.drive(ConnectionEvent::Joined).await;
            }
            ServerFrame::Joining { member } => {
                self.roster.insert(member.id, member);
            }
            ServerFrame::Leaving { member } => {
                self.roster.remove(&member.id);
            }
            ServerFrame::Whisper { whisper } => self.apply_whisper(whisper),
            ServerFrame::Error { code, message, retryable } => {
                warn!(document_id = %self.document_id, %code, %message, retryable, "relay reported a channel error");
            }
        }
    }

    /// Wait for the next relay frame and apply it. Returns `false` once the
    /// channel is gone; embedders that skip [`run`](Self::run) call this in their own loop.
    pub async fn process_next_frame(&mut self) -> bool {
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        match link.recv().await {
            Some(frame) => {
                self.handle_frame(frame).await;
                true
            }
            None => {
                self.channel_lost("presence channel closed").await;
                false
            }
        }
    }

    /// Process finished saves and any timers that are due.
    pub async fn tick(&mut self) {
        while let Ok(outcome) = self.saves_rx.try_recv() {
            self.finish_save(outcome);
        }

        let now = self.clock.now();
        if let Some(ticket) = self.autosave.poll(now) {
            self.start_flush(ticket);
        }
        self.drive(ConnectionEvent::Tick).await;
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.autosave.deadline(), self.connection.next_retry_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Wait for the in-flight save, if any, and record its outcome.
    pub async fn wait_for_save(&mut self) -> Option<bool> {
        if !self.autosave.is_in_flight() {
            return None;
        }
        let outcome = self.saves_rx.recv().await?;
        let succeeded = outcome.result.is_ok();
        self.finish_save(outcome);
        Some(succeeded)
    }

    /// The channel dropped underneath us.
    pub async fn channel_lost(&mut self, reason: &str) {
        self.link = None;
        self.drive(ConnectionEvent::ChannelLost { reason: reason.to_string() }).await;
    }

    /// Best-effort final save, then leave the channel.
    pub async fn close(mut self) {
        self.wait_for_save().await;

        if let Some(ticket) = self.autosave.teardown() {
            let request = self.save_request(&ticket);
            let result = self.api.save_update(self.document_id, request).await;
            if let Err(error) = &result {
                warn!(document_id = %self.document_id, %error, "final save on close failed");
            }
            self.autosave.complete(&ticket, result.is_ok());
        }

        self.drive(ConnectionEvent::Shutdown).await;
        debug!(document_id = %self.document_id, stats = ?self.autosave.stats(), "session closed");
    }

    /// Drive the session from a command stream until `Close` or the sender goes away.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        if self.connection.state() == ConnectionState::Disconnected
            && !self.connection.is_exhausted()
        {
            self.connect().await;
        }

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Close) | None => break,
                    Some(command) => self.execute(command).await,
                },
                frame = next_frame(&mut self.link) => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => self.channel_lost("presence channel closed").await,
                },
                Some(outcome) = self.saves_rx.recv() => self.finish_save(outcome),
                _ = sleep_until(deadline) => self.tick().await,
            }
        }

        self.close().await;
    }

    async fn execute(&mut self, command: SessionCommand) {
        let result = match command {
            SessionCommand::Insert { index, chunk } => self.insert_text(index, &chunk).await,
            SessionCommand::Remove { index, count } => self.remove_text(index, count).await,
            SessionCommand::ApplyUpdate(update) => self.apply_local_update(&update).await,
            SessionCommand::Restore { version_number } => {
                self.restore_version(version_number).await
            }
            SessionCommand::Reconnect => {
                self.reconnect().await;
                Ok(())
            }
            SessionCommand::Close => Ok(()),
        };
        if let Err(error) = result {
            warn!(document_id = %self.document_id, %error, "session command failed");
        }
    }

    async fn after_mutation(&mut self, mutation: Mutation) {
        if !mutation.propagates() {
            return;
        }

        let state = self.replica.encode_state();
        if state.len() > payload::MAX_CONTENT_BYTES {
            warn!(
                document_id = %self.document_id,
                state_bytes = state.len(),
                limit = payload::MAX_CONTENT_BYTES,
                "document state exceeds the channel limit; not whispering this edit"
            );
        } else {
            self.whisper(Whisper::update(&state, &self.identity)).await;
        }

        if let Some(ticket) = self.autosave.record_local_mutation(self.clock.now()) {
            self.start_flush(ticket);
        }
    }

    fn apply_whisper(&mut self, whisper: Whisper) {
        if whisper.is_from(self.identity.id) {
            debug!(kind = whisper.kind(), "ignoring self-echo whisper");
            return;
        }

        let content = match whisper.decode_content() {
            Ok(content) => content,
            Err(error) => {
                warn!(kind = whisper.kind(), sender = %whisper.sender_id(), %error, "ignoring undecodable whisper");
                return;
            }
        };

        let applied = match &whisper {
            Whisper::Update { .. } => self.replica.apply_remote(&content),
            Whisper::Restore { version_number, .. } => {
                info!(version_number, sender = %whisper.sender_id(), "peer restored a version");
                self.replica.replace_with(&content)
            }
        };
        if let Err(error) = applied {
            warn!(kind = whisper.kind(), sender = %whisper.sender_id(), %error, "ignoring whisper that does not apply");
        }
    }

    async fn whisper(&mut self, whisper: Whisper) {
        let Some(link) = &self.link else {
            return;
        };
        if let Err(error) = link.send(ClientFrame::Whisper { whisper }).await {
            self.channel_lost(&error.to_string()).await;
        }
    }

    fn save_request(&self, ticket: &FlushTicket) -> SaveRequest {
        SaveRequest {
            content: payload::encode(&self.replica.encode_state()),
            update_count: ticket.update_count,
        }
    }

    fn start_flush(&self, ticket: FlushTicket) {
        let request = self.save_request(&ticket);
        let api = Arc::clone(&self.api);
        let saves_tx = self.saves_tx.clone();
        let document_id = self.document_id;

        tokio::spawn(
            async move {
                let result = api.save_update(document_id, request).await;
                if saves_tx.send(SaveOutcome { ticket, result }).is_err() {
                    debug!(document_id = %document_id, "session ended before its save finished");
                }
            }
            .instrument(info_span!("client.autosave.flush", document_id = %document_id)),
        );
    }

    fn finish_save(&mut self, outcome: SaveOutcome) {
        match &outcome.result {
            Ok(response) => debug!(
                document_id = %self.document_id,
                update_count = outcome.ticket.update_count,
                snapshot_created = response.snapshot_created,
                "autosave succeeded"
            ),
            Err(error) => warn!(
                document_id = %self.document_id,
                update_count = outcome.ticket.update_count,
                %error,
                "autosave failed; the next edit schedules another save"
            ),
        }
        self.autosave.complete(&outcome.ticket, outcome.result.is_ok());
    }

    async fn drive(&mut self, event: ConnectionEvent) {
        let mut events = VecDeque::from([event]);

        while let Some(event) = events.pop_front() {
            let now = self.clock.now();
            for command in self.connection.handle(event, now) {
                match command {
                    Command::Join => match self.connector.join(self.document_id).await {
                        // Joined follows once the relay sends the `here` roster.
                        Ok(link) => self.link = Some(link),
                        Err(error) if error.is_permanent() => {
                            events.push_back(ConnectionEvent::JoinRejected { reason: error.to_string() });
                        }
                        Err(error) => {
                            events.push_back(ConnectionEvent::ChannelLost { reason: error.to_string() });
                        }
                    },
                    Command::ScheduleRetry { .. } => {}
                    Command::RequireManualRetry { reason } => {
                        self.manual_retry_reason = Some(reason);
                    }
                    Command::Leave => {
                        self.link = None;
                        self.roster.clear();
                    }
                }
            }
        }
    }
}

async fn next_frame(link: &mut Option<ChannelLink>) -> Option<ServerFrame> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
