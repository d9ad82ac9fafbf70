// Keyed store whose entries expire after a fixed TTL.
//
// Holds the per-document "last snapshot" timestamps. Expiry is judged against
// the injected clock so tests can step time explicitly.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;

use super::clock::Clock;

pub type ClockStoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage for per-document snapshot baselines.
///
/// Implementations may be remote caches, so every call is async and fallible.
pub trait SnapshotClockStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> ClockStoreFuture<'a, Option<DateTime<Utc>>>;
    fn put<'a>(&'a self, key: &'a str, at: DateTime<Utc>) -> ClockStoreFuture<'a, ()>;
}

#[derive(Debug, Clone)]
struct TtlEntry {
    value: DateTime<Utc>,
    stored_at: DateTime<Utc>,
}

/// In-process TTL store.
#[derive(Clone)]
pub struct MemoryTtlStore {
    entries: Arc<RwLock<HashMap<String, TtlEntry>>>,
    ttl: ChronoDuration,
    clock: Arc<dyn Clock>,
}

impl MemoryTtlStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(365)),
            clock,
        }
    }

    fn is_live(&self, entry: &TtlEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.stored_at) < self.ttl
    }

    /// Remove expired entries. Called periodically from the server.
    pub async fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, entry| self.is_live(entry, now));
        before - guard.len()
    }

    /// Number of stored entries (including expired ones not yet evicted).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl SnapshotClockStore for MemoryTtlStore {
    fn get<'a>(&'a self, key: &'a str) -> ClockStoreFuture<'a, Option<DateTime<Utc>>> {
        Box::pin(async move {
            let now = self.clock.now();
            let guard = self.entries.read().await;
            Ok(guard.get(key).filter(|entry| self.is_live(entry, now)).map(|entry| entry.value))
        })
    }

    fn put<'a>(&'a self, key: &'a str, at: DateTime<Utc>) -> ClockStoreFuture<'a, ()> {
        Box::pin(async move {
            let stored_at = self.clock.now();
            self.entries.write().await.insert(key.to_owned(), TtlEntry { value: at, stored_at });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryTtlStore, SnapshotClockStore};
    use crate::sync::clock::{Clock, ManualClock};
    use std::{sync::Arc, time::Duration};

    fn store_with_clock(ttl_secs: u64) -> (MemoryTtlStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (MemoryTtlStore::new(Duration::from_secs(ttl_secs), clock.clone()), clock)
    }

    #[tokio::test]
    async fn stored_value_is_returned_until_ttl_elapses() {
        let (store, clock) = store_with_clock(60);
        let at = clock.now();
        store.put("doc_a_last_snapshot", at).await.expect("put");

        clock.advance(Duration::from_secs(59));
        assert_eq!(store.get("doc_a_last_snapshot").await.expect("get"), Some(at));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("doc_a_last_snapshot").await.expect("get"), None);
    }

    #[tokio::test]
    async fn put_refreshes_expiry() {
        let (store, clock) = store_with_clock(10);
        store.put("k", clock.now()).await.expect("put");
        clock.advance(Duration::from_secs(8));
        store.put("k", clock.now()).await.expect("put");
        clock.advance(Duration::from_secs(8));
        assert!(store.get("k").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn evict_expired_drops_only_stale_entries() {
        let (store, clock) = store_with_clock(10);
        store.put("old", clock.now()).await.expect("put");
        clock.advance(Duration::from_secs(6));
        store.put("fresh", clock.now()).await.expect("put");
        clock.advance(Duration::from_secs(5));

        assert_eq!(store.evict_expired().await, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get("fresh").await.expect("get").is_some());
    }
}
