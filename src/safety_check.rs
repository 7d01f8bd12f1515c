use serde::{Deserialize, Serialize};

use crate::config::MonitorConfig;
use crate::model::UnixTimeMs;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum SafetyCheckState {
    Idle,
    #[serde(rename_all = "camelCase")]
    AwaitingResponse {
        generation: u64,
        deadline: UnixTimeMs,
        remaining: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Tick belongs to a check that was already resolved or replaced.
    Stale,
    Counting { remaining: u32 },
    /// Countdown reached zero; the check is back to idle and must escalate.
    Expired { generation: u64 },
}

/// "Are you safe?" confirmation countdown.
///
/// Every check gets a fresh generation. Ticks carry the generation they were scheduled
/// for, so a tick racing with a user response is discarded instead of counting down a
/// newer check.
#[derive(Debug, Clone)]
pub struct SafetyCheck {
    state: SafetyCheckState,
    last_generation: u64,
    countdown_secs: u32,
    countdown_ms: u64,
}

impl SafetyCheck {
    #[must_use]
    pub fn new(config: &MonitorConfig) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self {
            state: SafetyCheckState::Idle,
            last_generation: 0,
            countdown_secs: config.countdown_secs,
            countdown_ms: config.countdown_duration().as_millis() as u64,
        }
    }

    /// Enters `AwaitingResponse`. Returns the new generation, or `None` when a check is
    /// already outstanding.
    pub fn request(&mut self, now: UnixTimeMs) -> Option<u64> {
        if self.is_awaiting() {
            return None;
        }
        self.last_generation += 1;
        self.state = SafetyCheckState::AwaitingResponse {
            generation: self.last_generation,
            deadline: now.add_millis(self.countdown_ms),
            remaining: self.countdown_secs,
        };
        Some(self.last_generation)
    }

    pub fn tick(&mut self, generation: u64) -> TickOutcome {
        let SafetyCheckState::AwaitingResponse {
            generation: current,
            deadline,
            remaining,
        } = self.state
        else {
            return TickOutcome::Stale;
        };
        if current != generation {
            return TickOutcome::Stale;
        }

        let remaining = remaining.saturating_sub(1);
        if remaining == 0 {
            self.state = SafetyCheckState::Idle;
            return TickOutcome::Expired { generation };
        }
        self.state = SafetyCheckState::AwaitingResponse {
            generation,
            deadline,
            remaining,
        };
        TickOutcome::Counting { remaining }
    }

    /// Ends the outstanding check after a user response. Returns its generation, or
    /// `None` when nothing was awaiting.
    pub fn resolve(&mut self) -> Option<u64> {
        match self.state {
            SafetyCheckState::AwaitingResponse { generation, .. } => {
                self.state = SafetyCheckState::Idle;
                Some(generation)
            }
            SafetyCheckState::Idle => None,
        }
    }

    /// Ends the check of the given generation without waiting for the countdown.
    /// Used when the countdown timer could not be scheduled.
    pub fn abandon(&mut self, generation: u64) -> bool {
        if self.current_generation() == Some(generation) {
            self.state = SafetyCheckState::Idle;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub const fn state(&self) -> SafetyCheckState {
        self.state
    }

    #[must_use]
    pub const fn is_awaiting(&self) -> bool {
        matches!(self.state, SafetyCheckState::AwaitingResponse { .. })
    }

    #[must_use]
    pub const fn current_generation(&self) -> Option<u64> {
        match self.state {
            SafetyCheckState::AwaitingResponse { generation, .. } => Some(generation),
            SafetyCheckState::Idle => None,
        }
    }

    #[must_use]
    pub const fn remaining(&self) -> Option<u32> {
        match self.state {
            SafetyCheckState::AwaitingResponse { remaining, .. } => Some(remaining),
            SafetyCheckState::Idle => None,
        }
    }
}
