//! Reconnection policy and episode state.
//!
//! Transitions are plain functions of the current time so they can be
//! exercised without timers; the connection driver owns the actual sleeping.

use std::time::Duration;

use tokio::time::Instant;

/// Fixed delay between attempts.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(1_000);
/// Total time an episode may keep retrying, measured from the first failure.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: INITIAL_RECONNECT_DELAY,
            max_delay: MAX_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    /// An episode is running since `episode_start` (the first disconnect).
    Retrying { episode_start: Instant },
}

/// What to do after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Reconnection is off; the disconnect is terminal.
    Disabled,
    /// Schedule another attempt after the delay.
    Retry(Duration),
    /// The window is used up; the episode ended.
    Exhausted,
}

/// What to do when a scheduled attempt comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Connect,
    Exhausted,
    /// Reconnection was disabled or the episode already ended.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    state: ReconnectState,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ReconnectState::Idle,
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn is_retrying(&self) -> bool {
        matches!(self.state, ReconnectState::Retrying { .. })
    }

    /// Time since the episode started, if one is running.
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        match self.state {
            ReconnectState::Idle => None,
            ReconnectState::Retrying { episode_start } => {
                Some(now.saturating_duration_since(episode_start))
            }
        }
    }

    /// A session went down. Starts an episode on the first disconnect only;
    /// later disconnects keep the first start.
    pub fn on_disconnect(&mut self, enabled: bool, now: Instant) -> DisconnectOutcome {
        if !enabled {
            return DisconnectOutcome::Disabled;
        }
        let episode_start = match self.state {
            ReconnectState::Retrying { episode_start } => episode_start,
            ReconnectState::Idle => {
                self.state = ReconnectState::Retrying { episode_start: now };
                now
            }
        };
        if now.saturating_duration_since(episode_start) >= self.policy.max_delay {
            self.state = ReconnectState::Idle;
            return DisconnectOutcome::Exhausted;
        }
        DisconnectOutcome::Retry(self.policy.delay)
    }

    /// A scheduled attempt fired. Re-checked here, not just when scheduling,
    /// since `end()` may have happened in between.
    pub fn on_retry_due(&mut self, enabled: bool, now: Instant) -> RetryDecision {
        if !enabled {
            self.state = ReconnectState::Idle;
            return RetryDecision::Cancelled;
        }
        match self.state {
            ReconnectState::Idle => RetryDecision::Cancelled,
            ReconnectState::Retrying { episode_start } => {
                if now.saturating_duration_since(episode_start) >= self.policy.max_delay {
                    self.state = ReconnectState::Idle;
                    RetryDecision::Exhausted
                } else {
                    RetryDecision::Connect
                }
            }
        }
    }

    /// A transport opened. Returns true when it concluded an episode.
    pub fn on_open(&mut self) -> bool {
        let reconnected = self.is_retrying();
        self.state = ReconnectState::Idle;
        reconnected
    }

    /// Abandon any running episode.
    pub fn cancel(&mut self) {
        self.state = ReconnectState::Idle;
    }
}
