use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// Per-document write locks. Save, snapshot and restore on one document
/// run one at a time; different documents never contend.
#[derive(Debug, Default)]
pub struct DocumentLocks {
    locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, document_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self.lock_for_document(document_id).await;
        lock.lock_owned()
            .instrument(info_span!("relay.sync.wait_document_lock", document_id = %document_id))
            .await
    }

    /// Drop locks nobody is holding or waiting on.
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.write().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    async fn lock_for_document(&self, document_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.read().await.get(&document_id).cloned() {
            return existing;
        }

        let mut locks = self.locks.write().await;
        locks.entry(document_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}
