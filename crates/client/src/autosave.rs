// Autosave scheduler.
//
// Coalesces local mutations into full-state saves: a single debounce timer
// restarted on every mutation, an immediate flush once enough mutations pile
// up, and at most one save in flight. A flush requested while another is in
// flight is dropped and counted; the next mutation or teardown picks the
// changes up again.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

const DEFAULT_DEBOUNCE_SECS: u64 = 10;
const DEFAULT_FLUSH_THRESHOLD: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutosavePolicy {
    pub debounce: Duration,
    /// Pending mutation count that flushes without waiting for the timer.
    pub flush_threshold: u32,
}

impl Default for AutosavePolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(DEFAULT_DEBOUNCE_SECS),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Debounce,
    Threshold,
    Teardown,
}

/// Permission to run one save. Hand it back through [`AutosaveScheduler::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushTicket {
    pub update_count: u32,
    pub trigger: FlushTrigger,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutosaveStats {
    pub flushes_started: u64,
    pub flushes_succeeded: u64,
    pub flushes_failed: u64,
    pub flushes_dropped: u64,
}

#[derive(Debug, Clone)]
pub struct AutosaveScheduler {
    policy: AutosavePolicy,
    pending_updates: u32,
    deadline: Option<Instant>,
    in_flight: bool,
    // Local changes not yet covered by a started flush.
    dirty: bool,
    stats: AutosaveStats,
}

impl AutosaveScheduler {
    pub fn new(policy: AutosavePolicy) -> Self {
        Self {
            policy,
            pending_updates: 0,
            deadline: None,
            in_flight: false,
            dirty: false,
            stats: AutosaveStats::default(),
        }
    }

    pub fn pending_updates(&self) -> u32 {
        self.pending_updates
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn stats(&self) -> AutosaveStats {
        self.stats
    }

    /// Count one local mutation and restart the debounce timer.
    ///
    /// Returns a ticket when the threshold is reached and no save is running.
    pub fn record_local_mutation(&mut self, now: Instant) -> Option<FlushTicket> {
        self.pending_updates = self.pending_updates.saturating_add(1);
        self.dirty = true;

        if self.pending_updates >= self.policy.flush_threshold {
            self.deadline = None;
            return self.request_flush(FlushTrigger::Threshold);
        }

        self.deadline = Some(now + self.policy.debounce);
        None
    }

    /// Fire the debounce timer if it has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<FlushTicket> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.request_flush(FlushTrigger::Debounce)
            }
            _ => None,
        }
    }

    /// Final flush when the session closes, after any in-flight save has finished.
    ///
    /// Covers edits made while the last save was running even though its
    /// completion reset the counter.
    pub fn teardown(&mut self) -> Option<FlushTicket> {
        self.deadline = None;
        if !self.dirty {
            return None;
        }
        self.request_flush(FlushTrigger::Teardown)
    }

    /// Mark the in-flight save finished. The counter resets either way.
    pub fn complete(&mut self, ticket: &FlushTicket, succeeded: bool) {
        self.in_flight = false;
        self.pending_updates = 0;
        if succeeded {
            self.stats.flushes_succeeded += 1;
        } else {
            self.stats.flushes_failed += 1;
        }
        debug!(update_count = ticket.update_count, succeeded, "autosave flush finished");
    }

    fn request_flush(&mut self, trigger: FlushTrigger) -> Option<FlushTicket> {
        if self.in_flight {
            self.stats.flushes_dropped += 1;
            warn!(
                ?trigger,
                pending_updates = self.pending_updates,
                dropped_total = self.stats.flushes_dropped,
                "autosave flush dropped: a save is already in flight"
            );
            return None;
        }

        self.in_flight = true;
        self.dirty = false;
        self.stats.flushes_started += 1;
        Some(FlushTicket { update_count: self.pending_updates, trigger })
    }
}

impl Default for AutosaveScheduler {
    fn default() -> Self {
        Self::new(AutosavePolicy::default())
    }
}
