use crate::capabilities::{HistorySaveOutcome, LocationError, SmsDelivery};
use crate::config::MonitorConfig;
use crate::model::{Contact, HistoryId, LocationSample, SessionId, UnixTimeMs, UserId};

pub use crate::capabilities::Effect;
pub use crate::notifier::SosReason;

// --- Event enum: user commands, shell reports and capability callbacks ---

/// Inputs to the monitor core. Everything except [`Event::Configure`] carries the shell's
/// clock reading at the moment the event was taken off the mailbox.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Sets the owner and thresholds. Sent once, before anything else.
    Configure {
        user_id: UserId,
        config: MonitorConfig,
    },

    // User commands
    StartWalk {
        contact: Contact,
        initial: Option<LocationSample>,
        at: UnixTimeMs,
    },
    RespondSafe { at: UnixTimeMs },
    RespondUnsafe { at: UnixTimeMs },
    ManualSos { at: UnixTimeMs },
    RetrySos { at: UnixTimeMs },
    EndWalk { at: UnixTimeMs },

    // Shell reports
    LocationReceived { sample: LocationSample, at: UnixTimeMs },
    LocationLost { error: LocationError, at: UnixTimeMs },
    ImmobilityPoll { at: UnixTimeMs },
    CountdownTick { generation: u64, at: UnixTimeMs },
    /// The countdown timer for this check could not be scheduled.
    CountdownUnavailable { generation: u64, at: UnixTimeMs },

    // Capability callbacks
    SmsCompleted {
        session_id: SessionId,
        attempt: u32,
        delivery: SmsDelivery,
    },
    HistorySaved {
        history_id: HistoryId,
        outcome: HistorySaveOutcome,
    },
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Configure { .. } => "configure",
            Self::StartWalk { .. } => "start_walk",
            Self::RespondSafe { .. } => "respond_safe",
            Self::RespondUnsafe { .. } => "respond_unsafe",
            Self::ManualSos { .. } => "manual_sos",
            Self::RetrySos { .. } => "retry_sos",
            Self::EndWalk { .. } => "end_walk",
            Self::LocationReceived { .. } => "location_received",
            Self::LocationLost { .. } => "location_lost",
            Self::ImmobilityPoll { .. } => "immobility_poll",
            Self::CountdownTick { .. } => "countdown_tick",
            Self::CountdownUnavailable { .. } => "countdown_unavailable",
            Self::SmsCompleted { .. } => "sms_completed",
            Self::HistorySaved { .. } => "history_saved",
        }
    }

    /// When the event happened, if it says.
    #[must_use]
    pub const fn at(&self) -> Option<UnixTimeMs> {
        match self {
            Self::Configure { .. } => None,
            Self::StartWalk { at, .. }
            | Self::RespondSafe { at }
            | Self::RespondUnsafe { at }
            | Self::ManualSos { at }
            | Self::RetrySos { at }
            | Self::EndWalk { at }
            | Self::LocationReceived { at, .. }
            | Self::LocationLost { at, .. }
            | Self::ImmobilityPoll { at }
            | Self::CountdownTick { at, .. }
            | Self::CountdownUnavailable { at, .. } => Some(*at),
            Self::SmsCompleted { delivery, .. } => Some(delivery.at),
            Self::HistorySaved { outcome, .. } => Some(outcome.at),
        }
    }
}
