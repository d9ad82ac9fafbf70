// Durable state for documents: content store, event log, version store,
// plus the user and share rows the access checks read from.
//
// Every operation exists for PostgreSQL and for the in-memory backend;
// `DocumentStore` dispatches on the variant.

mod memory;
mod postgres;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use draftsync_common::types::{ActorInfo, DocumentSummary, EventKind, VersionSummary};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use memory::MemoryDocumentStore;

#[derive(Clone)]
pub enum DocumentStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryDocumentStore>>),
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryDocumentStore::default())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn into_summary(self) -> DocumentSummary {
        DocumentSummary {
            id: self.id,
            title: self.title,
            owner_id: self.owner_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Permission stored on a share row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharePermission {
    View,
    Edit,
}

impl SharePermission {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Edit => "edit",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "view" => Some(Self::View),
            "edit" => Some(Self::Edit),
            _ => None,
        }
    }
}

/// Effective access a user has on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Owner,
    Shared(SharePermission),
}

impl AccessLevel {
    pub fn can_edit(self) -> bool {
        matches!(self, Self::Owner | Self::Shared(SharePermission::Edit))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: i64,
    pub document_id: Uuid,
    pub actor_id: Uuid,
    pub kind: EventKind,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub version_number: i64,
    pub actor: ActorInfo,
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl VersionRecord {
    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            id: self.id,
            version_number: self.version_number,
            actor: self.actor.clone(),
            created_at: self.created_at,
        }
    }
}

/// Result of trying to cut the next numbered version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionInsert {
    Created(VersionRecord),
    /// The document has no content yet; nothing to snapshot.
    EmptyContent,
    DocumentMissing,
    /// Another writer claimed the same version number first.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionListing {
    pub items: Vec<VersionSummary>,
    pub total: i64,
}

impl DocumentStore {
    pub fn memory() -> Self {
        Self::default()
    }

    pub async fn upsert_user(&self, user_id: Uuid, display_name: &str) -> Result<()> {
        match self {
            Self::Postgres(pool) => postgres::upsert_user(pool, user_id, display_name).await,
            Self::Memory(store) => {
                store.write().await.upsert_user(user_id, display_name);
                Ok(())
            }
        }
    }

    pub async fn create_document(&self, owner_id: Uuid, title: &str) -> Result<DocumentRecord> {
        match self {
            Self::Postgres(pool) => postgres::create_document(pool, owner_id, title).await,
            Self::Memory(store) => Ok(store.write().await.create_document(owner_id, title)),
        }
    }

    pub async fn find_document(&self, document_id: Uuid) -> Result<Option<DocumentRecord>> {
        match self {
            Self::Postgres(pool) => postgres::find_document(pool, document_id).await,
            Self::Memory(store) => Ok(store.read().await.find_document(document_id)),
        }
    }

    /// Current content blob; `None` when the document is missing or was never saved.
    pub async fn document_content(&self, document_id: Uuid) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Postgres(pool) => postgres::document_content(pool, document_id).await,
            Self::Memory(store) => Ok(store.read().await.document_content(document_id)),
        }
    }

    pub async fn access_level(&self, document_id: Uuid, user_id: Uuid) -> Result<Option<AccessLevel>> {
        match self {
            Self::Postgres(pool) => postgres::access_level(pool, document_id, user_id).await,
            Self::Memory(store) => Ok(store.read().await.access_level(document_id, user_id)),
        }
    }

    /// Share rows are managed by the document-sharing surface; this writes one directly.
    pub async fn grant_share(
        &self,
        document_id: Uuid,
        user_id: Uuid,
        permission: SharePermission,
    ) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                postgres::grant_share(pool, document_id, user_id, permission).await
            }
            Self::Memory(store) => {
                store.write().await.grant_share(document_id, user_id, permission);
                Ok(())
            }
        }
    }

    /// Append an `update` event and overwrite the content in one transaction.
    pub async fn record_save(&self, document_id: Uuid, actor_id: Uuid, payload: &[u8]) -> Result<()> {
        match self {
            Self::Postgres(pool) => postgres::record_save(pool, document_id, actor_id, payload).await,
            Self::Memory(store) => store.write().await.record_save(document_id, actor_id, payload),
        }
    }

    /// Overwrite the content with a restored version and append a `restore` event.
    pub async fn record_restore(
        &self,
        document_id: Uuid,
        actor_id: Uuid,
        content: &[u8],
    ) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                postgres::record_restore(pool, document_id, actor_id, content).await
            }
            Self::Memory(store) => store.write().await.record_restore(document_id, actor_id, content),
        }
    }

    pub async fn latest_version_number(&self, document_id: Uuid) -> Result<i64> {
        match self {
            Self::Postgres(pool) => postgres::latest_version_number(pool, document_id).await,
            Self::Memory(store) => Ok(store.read().await.latest_version_number(document_id)),
        }
    }

    /// Snapshot the current content as version `latest + 1`.
    pub async fn insert_next_version(&self, document_id: Uuid, actor_id: Uuid) -> Result<VersionInsert> {
        match self {
            Self::Postgres(pool) => postgres::insert_next_version(pool, document_id, actor_id).await,
            Self::Memory(store) => Ok(store.write().await.insert_next_version(document_id, actor_id)),
        }
    }

    /// One page of versions, newest first. `page` is 1-based.
    pub async fn list_versions(
        &self,
        document_id: Uuid,
        page: u32,
        per_page: u32,
    ) -> Result<VersionListing> {
        match self {
            Self::Postgres(pool) => postgres::list_versions(pool, document_id, page, per_page).await,
            Self::Memory(store) => Ok(store.read().await.list_versions(document_id, page, per_page)),
        }
    }

    pub async fn find_version(
        &self,
        document_id: Uuid,
        version_number: i64,
    ) -> Result<Option<VersionRecord>> {
        match self {
            Self::Postgres(pool) => postgres::find_version(pool, document_id, version_number).await,
            Self::Memory(store) => Ok(store.read().await.find_version(document_id, version_number)),
        }
    }

    /// Event log in creation order.
    pub async fn list_events(&self, document_id: Uuid) -> Result<Vec<EventRecord>> {
        match self {
            Self::Postgres(pool) => postgres::list_events(pool, document_id).await,
            Self::Memory(store) => Ok(store.read().await.list_events(document_id)),
        }
    }
}

fn page_offset(page: u32, per_page: u32) -> i64 {
    i64::from(page.max(1) - 1) * i64::from(per_page)
}
