use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::capabilities::{LocationError, ScheduleError, SmsError, StoreError};
use crate::config::ConfigError;
use crate::geo::CoordinateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoRecipient,
    SendFailed,
    Timeout,
    AlreadySent,
    PermissionDenied,
    LocationUnavailable,
    NoActiveSession,
    AlreadyActive,
    Validation,
    Storage,
    Scheduler,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NoRecipient => "NO_RECIPIENT",
            Self::SendFailed => "SEND_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::AlreadySent => "ALREADY_SENT",
            Self::PermissionDenied => "LOCATION_PERMISSION_DENIED",
            Self::LocationUnavailable => "LOCATION_UNAVAILABLE",
            Self::NoActiveSession => "NO_ACTIVE_SESSION",
            Self::AlreadyActive => "SESSION_ALREADY_ACTIVE",
            Self::Validation => "VALIDATION_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Scheduler => "SCHEDULER_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether repeating the same action may succeed. SOS delivery is retryable only through
    /// the explicit manual retry, never automatically.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::SendFailed | Self::Timeout | Self::LocationUnavailable | Self::Storage
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: BTreeMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::NoRecipient => {
                "Your trusted contact has no phone number, so an SOS message cannot be sent."
                    .into()
            }
            ErrorKind::SendFailed => {
                "The SOS message could not be delivered. You can try sending it again.".into()
            }
            ErrorKind::Timeout => {
                "The SOS message timed out. You can try sending it again.".into()
            }
            ErrorKind::AlreadySent => "An SOS message has already been sent for this walk.".into(),
            ErrorKind::PermissionDenied => {
                "Location access is required to monitor your walk. Please enable location permissions in Settings."
                    .into()
            }
            ErrorKind::LocationUnavailable => {
                "Your location is currently unavailable. Monitoring continues with the last known position."
                    .into()
            }
            ErrorKind::NoActiveSession => "There is no active walk.".into(),
            ErrorKind::AlreadyActive => "A walk is already in progress.".into(),
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::Storage => "Your walk history could not be saved.".into(),
            ErrorKind::Scheduler | ErrorKind::Internal => {
                "An unexpected error occurred. Please try again.".into()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

/// Outcome of an SOS attempt that did not result in a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SosError {
    #[error("SOS already sent for this session")]
    AlreadySent,
    #[error("trusted contact has no phone number")]
    NoRecipient,
    #[error("SOS delivery failed: {0}")]
    SendFailed(String),
    #[error("SOS delivery timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("no failed SOS delivery to retry")]
    NothingToRetry,
}

impl SosError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadySent => ErrorKind::AlreadySent,
            Self::NoRecipient => ErrorKind::NoRecipient,
            Self::SendFailed(_) => ErrorKind::SendFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NothingToRetry => ErrorKind::Validation,
        }
    }
}

impl From<SmsError> for SosError {
    fn from(e: SmsError) -> Self {
        match e {
            SmsError::Timeout { timeout_ms } => SosError::Timeout { timeout_ms },
            other => SosError::SendFailed(other.to_string()),
        }
    }
}

/// Why the core refused the last command. Carried in the view so a shell can report it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "camelCase")]
pub enum Rejection {
    #[error("no active walk session")]
    NoActiveSession,
    #[error("a walk session is already active: {0}")]
    AlreadyActive(String),
    #[error(transparent)]
    Sos(SosError),
}

impl From<Rejection> for MonitorError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::NoActiveSession => Self::NoActiveSession,
            Rejection::AlreadyActive(id) => Self::AlreadyActive(id),
            Rejection::Sos(e) => Self::Sos(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("no active walk session")]
    NoActiveSession,
    #[error("a walk session is already active: {0}")]
    AlreadyActive(String),
    #[error("invalid contact: {0}")]
    InvalidContact(String),
    #[error(transparent)]
    Coordinate(#[from] CoordinateError),
    #[error(transparent)]
    Sos(#[from] SosError),
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("monitor task has stopped")]
    Closed,
}

impl MonitorError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoActiveSession => ErrorKind::NoActiveSession,
            Self::AlreadyActive(_) => ErrorKind::AlreadyActive,
            Self::InvalidContact(_) | Self::Coordinate(_) | Self::Config(_) => {
                ErrorKind::Validation
            }
            Self::Sos(e) => e.kind(),
            Self::Location(e) => e.kind(),
            Self::Storage(_) => ErrorKind::Storage,
            Self::Schedule(_) => ErrorKind::Scheduler,
            Self::Closed => ErrorKind::Internal,
        }
    }
}

impl From<MonitorError> for AppError {
    fn from(e: MonitorError) -> Self {
        AppError::new(e.kind(), e.to_string())
    }
}

impl From<SosError> for AppError {
    fn from(e: SosError) -> Self {
        AppError::new(e.kind(), e.to_string())
    }
}

impl From<LocationError> for AppError {
    fn from(e: LocationError) -> Self {
        AppError::new(e.kind(), e.to_string())
    }
}
