use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use super::{clock::Clock, ttl_store::SnapshotClockStore};
use crate::config::SnapshotSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDecision {
    /// Update count reached the threshold.
    UpdateThreshold,
    /// Enough time passed since the last snapshot.
    IntervalElapsed,
    /// No baseline existed; one was recorded and no snapshot is due.
    BaselineRecorded,
    NotDue,
}

impl SnapshotDecision {
    pub fn should_snapshot(self) -> bool {
        matches!(self, Self::UpdateThreshold | Self::IntervalElapsed)
    }
}

/// Pure threshold check, independent of where baselines are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    pub update_threshold: u32,
    pub interval: std::time::Duration,
}

impl From<SnapshotSettings> for SnapshotPolicy {
    fn from(settings: SnapshotSettings) -> Self {
        Self { update_threshold: settings.update_threshold, interval: settings.interval }
    }
}

impl SnapshotPolicy {
    pub fn evaluate(
        &self,
        cumulative_update_count: u32,
        last_snapshot_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SnapshotDecision {
        if cumulative_update_count >= self.update_threshold {
            return SnapshotDecision::UpdateThreshold;
        }

        let Some(last_snapshot_at) = last_snapshot_at else {
            return SnapshotDecision::BaselineRecorded;
        };

        let Some(interval) = ChronoDuration::from_std(self.interval).ok() else {
            return SnapshotDecision::NotDue;
        };

        if now.signed_duration_since(last_snapshot_at) >= interval {
            SnapshotDecision::IntervalElapsed
        } else {
            SnapshotDecision::NotDue
        }
    }
}

/// Decides per save whether a new version should be cut, remembering each
/// document's last snapshot time in an injected TTL store.
#[derive(Clone)]
pub struct SnapshotPolicyEngine {
    policy: SnapshotPolicy,
    clocks: Arc<dyn SnapshotClockStore>,
    clock: Arc<dyn Clock>,
}

impl SnapshotPolicyEngine {
    pub fn new(
        policy: SnapshotPolicy,
        clocks: Arc<dyn SnapshotClockStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { policy, clocks, clock }
    }

    pub async fn should_snapshot(
        &self,
        document_id: Uuid,
        cumulative_update_count: u32,
    ) -> Result<SnapshotDecision> {
        async {
            let key = last_snapshot_key(document_id);
            let now = self.clock.now();
            let last = self
                .clocks
                .get(&key)
                .await
                .context("failed to read last snapshot timestamp")?;

            let decision = self.policy.evaluate(cumulative_update_count, last, now);
            if decision == SnapshotDecision::BaselineRecorded {
                self.clocks
                    .put(&key, now)
                    .await
                    .context("failed to record snapshot baseline")?;
            }

            debug!(?decision, "snapshot policy evaluated");
            Ok(decision)
        }
        .instrument(info_span!(
            "relay.snapshot.should_snapshot",
            document_id = %document_id,
            cumulative_update_count
        ))
        .await
    }

    /// Record that a snapshot was just taken.
    pub async fn reset(&self, document_id: Uuid) -> Result<()> {
        self.clocks
            .put(&last_snapshot_key(document_id), self.clock.now())
            .await
            .context("failed to reset snapshot timestamp")
    }
}

fn last_snapshot_key(document_id: Uuid) -> String {
    format!("doc_{document_id}_last_snapshot")
}
