use std::sync::Arc;

use draftsync_common::{
    payload,
    protocol::channel::Whisper,
    types::{DocumentSummary, LoadDocumentResponse, VersionPage, VersionPreview},
};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{
    locks::DocumentLocks,
    snapshot::{SnapshotDecision, SnapshotPolicyEngine},
};
use crate::{
    auth::middleware::AuthenticatedUser,
    presence::{ChannelAccess, PresenceHub},
    store::{AccessLevel, DocumentRecord, DocumentStore, VersionInsert},
};

pub const MAX_TITLE_CHARS: usize = 255;
pub const MAX_CONTENT_BYTES: usize = payload::MAX_CONTENT_BYTES;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("document not found")]
    NotFound,
    #[error("version {0} not found")]
    VersionNotFound(i64),
    #[error("caller lacks required permission")]
    AccessDenied,
    #[error("{0}")]
    Validation(String),
    #[error("content is {size} bytes; limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub content: Vec<u8>,
    pub version_number: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requirement {
    View,
    Edit,
}

/// Orchestrates save, snapshot, restore and history reads against the store.
#[derive(Clone)]
pub struct SyncService {
    store: DocumentStore,
    policy: SnapshotPolicyEngine,
    locks: Arc<DocumentLocks>,
    presence: PresenceHub,
    versions_per_page: u32,
}

impl SyncService {
    pub fn new(
        store: DocumentStore,
        policy: SnapshotPolicyEngine,
        presence: PresenceHub,
        versions_per_page: u32,
    ) -> Self {
        Self {
            store,
            policy,
            locks: Arc::new(DocumentLocks::new()),
            presence,
            versions_per_page: versions_per_page.max(1),
        }
    }

    pub fn presence(&self) -> &PresenceHub {
        &self.presence
    }

    pub fn locks(&self) -> &DocumentLocks {
        &self.locks
    }

    pub async fn create_document(
        &self,
        actor: &AuthenticatedUser,
        title: &str,
    ) -> Result<DocumentSummary, SyncError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::Validation("title must not be empty".to_string()));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(SyncError::Validation(format!(
                "title must be at most {MAX_TITLE_CHARS} characters"
            )));
        }

        async {
            self.store.upsert_user(actor.user_id, &actor.display_name).await?;
            let document = self.store.create_document(actor.user_id, title).await?;
            info!(document_id = %document.id, "document created");
            Ok(document.into_summary())
        }
        .instrument(info_span!("relay.sync.create_document", owner_id = %actor.user_id))
        .await
    }

    pub async fn load_document(
        &self,
        document_id: Uuid,
        actor: &AuthenticatedUser,
    ) -> Result<LoadDocumentResponse, SyncError> {
        async {
            let document = self.authorize(document_id, actor, Requirement::View).await?;
            let content = self.store.document_content(document_id).await?;
            let version_number = self.store.latest_version_number(document_id).await?;

            Ok(LoadDocumentResponse {
                document: document.into_summary(),
                content: content.as_deref().map(payload::encode).unwrap_or_default(),
                version_number,
            })
        }
        .instrument(info_span!("relay.sync.load_document", document_id = %document_id))
        .await
    }

    /// Persist a client's full encoded state. Returns whether a version was cut.
    pub async fn save_update(
        &self,
        document_id: Uuid,
        actor: &AuthenticatedUser,
        content: Vec<u8>,
        update_count: u32,
    ) -> Result<bool, SyncError> {
        validate_content(&content)?;

        async {
            self.authorize(document_id, actor, Requirement::Edit).await?;
            self.store.upsert_user(actor.user_id, &actor.display_name).await?;

            let _guard = self.locks.lock(document_id).await;
            self.store.record_save(document_id, actor.user_id, &content).await?;

            let decision = match self.policy.should_snapshot(document_id, update_count).await {
                Ok(decision) => decision,
                Err(error) => {
                    warn!(error = ?error, "snapshot policy unavailable; skipping snapshot");
                    SnapshotDecision::NotDue
                }
            };
            if !decision.should_snapshot() {
                return Ok(false);
            }

            let created = self.snapshot_locked(document_id, actor).await?;
            if created.is_some() {
                self.reset_policy(document_id).await;
            }
            Ok(created.is_some())
        }
        .instrument(info_span!(
            "relay.sync.save_update",
            document_id = %document_id,
            actor_id = %actor.user_id,
            update_count,
            content_bytes = content.len()
        ))
        .await
    }

    /// Manual snapshot. Returns the new version number, or `None` when there
    /// was nothing to snapshot or a concurrent writer won the number.
    pub async fn create_snapshot(
        &self,
        document_id: Uuid,
        actor: &AuthenticatedUser,
    ) -> Result<Option<i64>, SyncError> {
        async {
            self.authorize(document_id, actor, Requirement::Edit).await?;
            self.store.upsert_user(actor.user_id, &actor.display_name).await?;

            let _guard = self.locks.lock(document_id).await;
            let created = self.snapshot_locked(document_id, actor).await?;
            if created.is_some() {
                self.reset_policy(document_id).await;
            }
            Ok(created)
        }
        .instrument(info_span!(
            "relay.sync.create_snapshot",
            document_id = %document_id,
            actor_id = %actor.user_id
        ))
        .await
    }

    /// Overwrite the content with a stored version and tell connected peers.
    /// No new version number is allocated.
    pub async fn restore_to_version(
        &self,
        document_id: Uuid,
        actor: &AuthenticatedUser,
        version_number: i64,
    ) -> Result<RestoreOutcome, SyncError> {
        async {
            self.authorize(document_id, actor, Requirement::Edit).await?;
            self.store.upsert_user(actor.user_id, &actor.display_name).await?;

            let outcome = {
                let _guard = self.locks.lock(document_id).await;
                let version = self
                    .store
                    .find_version(document_id, version_number)
                    .await?
                    .ok_or(SyncError::VersionNotFound(version_number))?;
                self.store.record_restore(document_id, actor.user_id, &version.content).await?;
                RestoreOutcome { content: version.content, version_number }
            };

            let notified = self
                .presence
                .publish(
                    document_id,
                    Whisper::restore(&outcome.content, version_number, &actor.as_member()),
                )
                .await;
            info!(notified, "document restored");
            Ok(outcome)
        }
        .instrument(info_span!(
            "relay.sync.restore_to_version",
            document_id = %document_id,
            actor_id = %actor.user_id,
            version_number
        ))
        .await
    }

    /// Newest-first page of versions. `page` is 1-based; 0 is treated as 1.
    pub async fn version_history(
        &self,
        document_id: Uuid,
        actor: &AuthenticatedUser,
        page: u32,
    ) -> Result<VersionPage, SyncError> {
        async {
            self.authorize(document_id, actor, Requirement::View).await?;
            let page = page.max(1);
            let per_page = self.versions_per_page;
            let listing = self.store.list_versions(document_id, page, per_page).await?;

            Ok(VersionPage {
                items: listing.items,
                total: listing.total,
                page,
                per_page,
                last_page: VersionPage::last_page_for(listing.total, per_page),
            })
        }
        .instrument(info_span!("relay.sync.version_history", document_id = %document_id, page))
        .await
    }

    /// Read-only preview of one version.
    pub async fn version_content(
        &self,
        document_id: Uuid,
        actor: &AuthenticatedUser,
        version_number: i64,
    ) -> Result<VersionPreview, SyncError> {
        async {
            self.authorize(document_id, actor, Requirement::View).await?;
            let version = self
                .store
                .find_version(document_id, version_number)
                .await?
                .ok_or(SyncError::VersionNotFound(version_number))?;

            Ok(VersionPreview {
                content: payload::encode(&version.content),
                version_number: version.version_number,
                created_at: version.created_at,
                actor: version.actor,
            })
        }
        .instrument(info_span!(
            "relay.sync.version_content",
            document_id = %document_id,
            version_number
        ))
        .await
    }

    /// Access check for joining a document's presence channel. View access
    /// admits the connection; only editors may relay updates over it.
    pub async fn authorize_channel(
        &self,
        document_id: Uuid,
        actor: &AuthenticatedUser,
    ) -> Result<ChannelAccess, SyncError> {
        let (_, level) = self.access(document_id, actor, Requirement::View).await?;
        Ok(ChannelAccess { member: actor.as_member(), can_edit: level.can_edit() })
    }

    async fn authorize(
        &self,
        document_id: Uuid,
        actor: &AuthenticatedUser,
        requirement: Requirement,
    ) -> Result<DocumentRecord, SyncError> {
        self.access(document_id, actor, requirement).await.map(|(document, _)| document)
    }

    async fn access(
        &self,
        document_id: Uuid,
        actor: &AuthenticatedUser,
        requirement: Requirement,
    ) -> Result<(DocumentRecord, AccessLevel), SyncError> {
        let document = self.store.find_document(document_id).await?.ok_or(SyncError::NotFound)?;
        let level = self
            .store
            .access_level(document_id, actor.user_id)
            .await?
            .ok_or(SyncError::AccessDenied)?;

        if requirement == Requirement::Edit && !level.can_edit() {
            return Err(SyncError::AccessDenied);
        }
        Ok((document, level))
    }

    /// Caller must hold the document lock.
    async fn snapshot_locked(
        &self,
        document_id: Uuid,
        actor: &AuthenticatedUser,
    ) -> Result<Option<i64>, SyncError> {
        match self.store.insert_next_version(document_id, actor.user_id).await? {
            VersionInsert::Created(version) => {
                info!(version_number = version.version_number, "version snapshot created");
                Ok(Some(version.version_number))
            }
            VersionInsert::EmptyContent => Ok(None),
            VersionInsert::Conflict => {
                warn!("concurrent snapshot claimed the version number; skipping");
                Ok(None)
            }
            VersionInsert::DocumentMissing => Err(SyncError::NotFound),
        }
    }

    async fn reset_policy(&self, document_id: Uuid) {
        if let Err(error) = self.policy.reset(document_id).await {
            warn!(error = ?error, "failed to reset snapshot policy timestamp");
        }
    }
}

fn validate_content(content: &[u8]) -> Result<(), SyncError> {
    if content.is_empty() {
        return Err(SyncError::Validation("content must not be empty".to_string()));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(SyncError::PayloadTooLarge { size: content.len(), limit: MAX_CONTENT_BYTES });
    }
    Ok(())
}
