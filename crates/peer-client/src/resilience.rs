//! Recovery policy for a link and for the signaling channel.
//!
//! Both state machines are pure: they are fed observations and the current
//! time, and answer with what the session actor should do next. The actor
//! owns the clock and the side effects.

use crate::media::PathState;
use std::time::Duration;
use tokio::time::Instant;

/// First reconnect delay after a channel loss.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What the session actor should do after an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    None,
    /// A disconnected check is now armed for this deadline.
    ScheduleCheck(Instant),
    /// Re-offer with the ICE restart flag.
    Restart { attempt: u32 },
    /// Budget spent; the link stays failed.
    GiveUp { error: String },
}

/// Per-link ICE restart budget and the pending disconnected check.
#[derive(Debug)]
pub struct RecoveryState {
    restart_attempts: u32,
    max_attempts: u32,
    check_delay: Duration,
    pending_check: Option<Instant>,
    exhausted: bool,
    last_error: Option<String>,
}

impl RecoveryState {
    #[must_use]
    pub fn new(max_attempts: u32, check_delay: Duration) -> Self {
        Self {
            restart_attempts: 0,
            max_attempts,
            check_delay,
            pending_check: None,
            exhausted: false,
            last_error: None,
        }
    }

    #[must_use]
    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    /// Deadline of the armed disconnected check.
    #[must_use]
    pub fn pending_check(&self) -> Option<Instant> {
        self.pending_check
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// React to a path state change.
    pub fn on_path_state(&mut self, state: PathState, now: Instant) -> RecoveryAction {
        match state {
            PathState::Connected => {
                self.restart_attempts = 0;
                self.pending_check = None;
                self.exhausted = false;
                self.last_error = None;
                RecoveryAction::None
            }
            PathState::Disconnected => {
                if self.exhausted || self.pending_check.is_some() {
                    return RecoveryAction::None;
                }
                let deadline = now + self.check_delay;
                self.pending_check = Some(deadline);
                RecoveryAction::ScheduleCheck(deadline)
            }
            PathState::Failed => {
                self.pending_check = None;
                self.attempt_restart("connection failed")
            }
            PathState::Closed => {
                self.pending_check = None;
                RecoveryAction::None
            }
            PathState::New | PathState::Connecting => RecoveryAction::None,
        }
    }

    /// The armed check fired; `current` is the path state right now.
    pub fn on_check_due(&mut self, current: PathState) -> RecoveryAction {
        self.pending_check = None;
        if current == PathState::Disconnected {
            self.attempt_restart("connection interrupted")
        } else {
            RecoveryAction::None
        }
    }

    /// A negotiation step failed; consumes a restart attempt.
    pub fn on_negotiation_failure(&mut self, reason: &str) -> RecoveryAction {
        self.attempt_restart(reason)
    }

    fn attempt_restart(&mut self, reason: &str) -> RecoveryAction {
        if self.exhausted {
            return RecoveryAction::None;
        }
        if self.restart_attempts >= self.max_attempts {
            self.exhausted = true;
            let error = format!(
                "{reason}; gave up after {} restart attempts",
                self.restart_attempts
            );
            self.last_error = Some(error.clone());
            return RecoveryAction::GiveUp { error };
        }
        self.restart_attempts += 1;
        RecoveryAction::Restart {
            attempt: self.restart_attempts,
        }
    }
}

/// Signaling reconnect budget with exponential backoff.
#[derive(Debug)]
pub struct ChannelRetry {
    attempts: u32,
    max_attempts: u32,
    backoff: Duration,
}

impl ChannelRetry {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            backoff: INITIAL_BACKOFF,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff = INITIAL_BACKOFF;
    }
}
