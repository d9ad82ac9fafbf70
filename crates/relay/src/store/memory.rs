use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::Utc;
use draftsync_common::types::{ActorInfo, EventKind};
use uuid::Uuid;

use super::{
    AccessLevel, DocumentRecord, EventRecord, SharePermission, VersionInsert, VersionListing,
    VersionRecord,
};

#[derive(Default)]
pub struct MemoryDocumentStore {
    users: HashMap<Uuid, String>,
    documents: HashMap<Uuid, MemoryDocument>,
    shares: HashMap<(Uuid, Uuid), SharePermission>,
    events: Vec<EventRecord>,
    versions: HashMap<Uuid, Vec<MemoryVersion>>,
    next_event_id: i64,
}

struct MemoryDocument {
    record: DocumentRecord,
    content: Option<Vec<u8>>,
}

struct MemoryVersion {
    id: Uuid,
    version_number: i64,
    actor_id: Uuid,
    content: Vec<u8>,
    created_at: chrono::DateTime<Utc>,
}

impl MemoryDocumentStore {
    pub(super) fn upsert_user(&mut self, user_id: Uuid, display_name: &str) {
        self.users.insert(user_id, display_name.to_owned());
    }

    pub(super) fn create_document(&mut self, owner_id: Uuid, title: &str) -> DocumentRecord {
        let now = Utc::now();
        let record = DocumentRecord {
            id: Uuid::new_v4(),
            owner_id,
            title: title.to_owned(),
            created_at: now,
            updated_at: now,
        };
        self.documents.insert(record.id, MemoryDocument { record: record.clone(), content: None });
        record
    }

    pub(super) fn find_document(&self, document_id: Uuid) -> Option<DocumentRecord> {
        self.documents.get(&document_id).map(|document| document.record.clone())
    }

    pub(super) fn document_content(&self, document_id: Uuid) -> Option<Vec<u8>> {
        self.documents.get(&document_id).and_then(|document| document.content.clone())
    }

    pub(super) fn access_level(&self, document_id: Uuid, user_id: Uuid) -> Option<AccessLevel> {
        let document = self.documents.get(&document_id)?;
        if document.record.owner_id == user_id {
            return Some(AccessLevel::Owner);
        }
        self.shares.get(&(document_id, user_id)).copied().map(AccessLevel::Shared)
    }

    pub(super) fn grant_share(
        &mut self,
        document_id: Uuid,
        user_id: Uuid,
        permission: SharePermission,
    ) {
        self.shares.insert((document_id, user_id), permission);
    }

    pub(super) fn record_save(&mut self, document_id: Uuid, actor_id: Uuid, payload: &[u8]) -> Result<()> {
        self.overwrite_content(document_id, payload)?;
        self.append_event(document_id, actor_id, EventKind::Update, payload);
        Ok(())
    }

    pub(super) fn record_restore(
        &mut self,
        document_id: Uuid,
        actor_id: Uuid,
        content: &[u8],
    ) -> Result<()> {
        self.overwrite_content(document_id, content)?;
        self.append_event(document_id, actor_id, EventKind::Restore, content);
        Ok(())
    }

    pub(super) fn latest_version_number(&self, document_id: Uuid) -> i64 {
        self.versions
            .get(&document_id)
            .and_then(|versions| versions.last())
            .map_or(0, |version| version.version_number)
    }

    pub(super) fn insert_next_version(&mut self, document_id: Uuid, actor_id: Uuid) -> VersionInsert {
        let Some(document) = self.documents.get(&document_id) else {
            return VersionInsert::DocumentMissing;
        };
        let content = match &document.content {
            Some(content) if !content.is_empty() => content.clone(),
            _ => return VersionInsert::EmptyContent,
        };

        let version = MemoryVersion {
            id: Uuid::new_v4(),
            version_number: self.latest_version_number(document_id) + 1,
            actor_id,
            content,
            created_at: Utc::now(),
        };
        let record = self.to_record(document_id, &version);
        self.versions.entry(document_id).or_default().push(version);
        VersionInsert::Created(record)
    }

    pub(super) fn list_versions(&self, document_id: Uuid, page: u32, per_page: u32) -> VersionListing {
        let versions = self.versions.get(&document_id).map(Vec::as_slice).unwrap_or_default();
        let offset = usize::try_from(super::page_offset(page, per_page)).unwrap_or(usize::MAX);
        let items = versions
            .iter()
            .rev()
            .skip(offset)
            .take(per_page as usize)
            .map(|version| self.to_record(document_id, version).summary())
            .collect();

        VersionListing { items, total: versions.len() as i64 }
    }

    pub(super) fn find_version(&self, document_id: Uuid, version_number: i64) -> Option<VersionRecord> {
        self.versions
            .get(&document_id)?
            .iter()
            .find(|version| version.version_number == version_number)
            .map(|version| self.to_record(document_id, version))
    }

    pub(super) fn list_events(&self, document_id: Uuid) -> Vec<EventRecord> {
        self.events.iter().filter(|event| event.document_id == document_id).cloned().collect()
    }

    fn overwrite_content(&mut self, document_id: Uuid, content: &[u8]) -> Result<()> {
        let Some(document) = self.documents.get_mut(&document_id) else {
            bail!("document {document_id} does not exist");
        };
        document.content = Some(content.to_vec());
        document.record.updated_at = Utc::now();
        Ok(())
    }

    fn append_event(&mut self, document_id: Uuid, actor_id: Uuid, kind: EventKind, payload: &[u8]) {
        self.next_event_id += 1;
        self.events.push(EventRecord {
            id: self.next_event_id,
            document_id,
            actor_id,
            kind,
            payload: payload.to_vec(),
            created_at: Utc::now(),
        });
    }

    fn to_record(&self, document_id: Uuid, version: &MemoryVersion) -> VersionRecord {
        VersionRecord {
            id: version.id,
            document_id,
            version_number: version.version_number,
            actor: ActorInfo {
                id: version.actor_id,
                name: self.users.get(&version.actor_id).cloned().unwrap_or_default(),
            },
            content: version.content.clone(),
            created_at: version.created_at,
        }
    }
}
