// Presence channel connection lifecycle.
//
// A pure state machine: callers feed it events stamped with the current
// instant and execute the commands it returns. No I/O or timers live here,
// so every transition is testable with a manual clock.

use std::time::{Duration, Instant};

use tracing::{info, warn};

const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Automatic retries before the user has to reconnect by hand.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`, where `attempt` counts prior failures.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Reconnecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller wants the channel open.
    Connect,
    /// The channel join completed and the roster arrived.
    Joined,
    /// The join failed or an open channel dropped.
    ChannelLost { reason: String },
    /// The relay refused the join outright (access denied, unknown document).
    JoinRejected { reason: String },
    /// Time passed; fires a scheduled retry once its deadline is reached.
    Tick,
    /// User-initiated retry. Resets the attempt counter.
    ManualReconnect,
    /// Session teardown.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open the channel and join the document.
    Join,
    /// A retry is due after `delay`. `attempt` is 1-based.
    ScheduleRetry { attempt: u32, delay: Duration },
    /// Automatic retries are exhausted.
    RequireManualRetry { reason: String },
    /// Close the channel.
    Leave,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    retry_at: Option<Instant>,
    exhausted: bool,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            retry_at: None,
            exhausted: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failures since the last successful join or manual reconnect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// The single transition function.
    pub fn handle(&mut self, event: ConnectionEvent, now: Instant) -> Vec<Command> {
        match event {
            ConnectionEvent::Connect => {
                if self.state != ConnectionState::Disconnected || self.exhausted {
                    return Vec::new();
                }
                self.retry_at = None;
                self.state = if self.attempts == 0 {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Reconnecting
                };
                vec![Command::Join]
            }

            ConnectionEvent::Joined => {
                if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Reconnecting)
                {
                    return Vec::new();
                }
                if self.attempts > 0 {
                    info!(attempts = self.attempts, "presence channel rejoined");
                }
                self.state = ConnectionState::Connected;
                self.attempts = 0;
                self.exhausted = false;
                Vec::new()
            }

            ConnectionEvent::ChannelLost { reason } => {
                if self.state == ConnectionState::Disconnected {
                    return Vec::new();
                }
                self.state = ConnectionState::Disconnected;

                if self.attempts >= self.policy.max_attempts {
                    self.exhausted = true;
                    self.retry_at = None;
                    warn!(
                        attempts = self.attempts,
                        reason = %reason,
                        "presence channel disconnected; manual retry required"
                    );
                    return vec![Command::RequireManualRetry { reason }];
                }

                let delay = self.policy.delay_for(self.attempts);
                self.attempts += 1;
                self.retry_at = Some(now + delay);
                info!(
                    attempt = self.attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "presence channel lost; retry scheduled"
                );
                vec![Command::ScheduleRetry { attempt: self.attempts, delay }]
            }

            ConnectionEvent::JoinRejected { reason } => {
                if self.state == ConnectionState::Disconnected {
                    return Vec::new();
                }
                self.state = ConnectionState::Disconnected;
                self.exhausted = true;
                self.retry_at = None;
                warn!(reason = %reason, "presence channel join rejected; manual retry required");
                vec![Command::RequireManualRetry { reason }]
            }

            ConnectionEvent::Tick => match self.retry_at {
                Some(at) if self.state == ConnectionState::Disconnected && now >= at => {
                    self.retry_at = None;
                    self.state = ConnectionState::Reconnecting;
                    vec![Command::Join]
                }
                _ => Vec::new(),
            },

            ConnectionEvent::ManualReconnect => {
                if self.state != ConnectionState::Disconnected {
                    return Vec::new();
                }
                self.attempts = 0;
                self.exhausted = false;
                self.retry_at = None;
                self.state = ConnectionState::Reconnecting;
                vec![Command::Join]
            }

            ConnectionEvent::Shutdown => {
                self.retry_at = None;
                let was_open = self.state != ConnectionState::Disconnected;
                self.state = ConnectionState::Disconnected;
                if was_open {
                    vec![Command::Leave]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}
