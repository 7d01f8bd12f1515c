use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::geo::Coordinate;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(UserId);
typed_id!(SessionId);
typed_id!(HistoryId);
typed_id!(ContactId);

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub const fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub const fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub const fn is_before(self, other: Self) -> bool {
        self.0 < other.0
    }
}

// --- Contacts ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContactError {
    #[error("contact name cannot be empty")]
    EmptyName,
    #[error("invalid phone number: {0}")]
    InvalidPhone(String),
}

/// Phone number normalised to an optional leading `+` followed by 7-15 digits.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    const MIN_DIGITS: usize = 7;
    const MAX_DIGITS: usize = 15;

    pub fn parse(raw: &str) -> Result<Self, ContactError> {
        let trimmed = raw.trim();
        let (plus, rest) = match trimmed.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        let mut digits = String::with_capacity(rest.len());
        for c in rest.chars() {
            match c {
                '0'..='9' => digits.push(c),
                ' ' | '-' | '(' | ')' | '.' => {}
                _ => return Err(ContactError::InvalidPhone(format!("unexpected character '{c}'"))),
            }
        }

        if !(Self::MIN_DIGITS..=Self::MAX_DIGITS).contains(&digits.len()) {
            return Err(ContactError::InvalidPhone(format!(
                "expected {}-{} digits, got {}",
                Self::MIN_DIGITS,
                Self::MAX_DIGITS,
                digits.len()
            )));
        }

        Ok(Self(if plus { format!("+{digits}") } else { digits }))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Phone numbers end up in logs through Debug; keep only the last two digits.
impl fmt::Debug for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail: String = self.0.chars().rev().take(2).collect::<Vec<_>>().into_iter().rev().collect();
        write!(f, "PhoneNumber(***{tail})")
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = ContactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}

/// Trusted contact for a walk. The phone number is required only for SOS.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub phone: Option<PhoneNumber>,
}

impl Contact {
    pub fn new(name: impl Into<String>, phone: Option<&str>) -> Result<Self, ContactError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(ContactError::EmptyName);
        }
        let phone = match phone.map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(PhoneNumber::parse(raw)?),
        };
        Ok(Self { name, phone })
    }
}

// --- Location ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub coordinate: Coordinate,
    pub speed_mps: f64,
    pub accuracy_m: f64,
    pub timestamp: UnixTimeMs,
    #[serde(default)]
    pub synthetic: bool,
}

impl LocationSample {
    /// Negative or non-finite speeds from the provider are clamped to 0.
    #[must_use]
    pub fn new(coordinate: Coordinate, speed_mps: f64, accuracy_m: f64, timestamp: UnixTimeMs) -> Self {
        let speed_mps = if speed_mps.is_finite() { speed_mps.max(0.0) } else { 0.0 };
        Self {
            coordinate,
            speed_mps,
            accuracy_m,
            timestamp,
            synthetic: false,
        }
    }

    #[must_use]
    pub fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }
}

/// Persisted shape of a path endpoint.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct LocationSnapshot {
    pub lat: f64,
    pub lng: f64,
    pub ts: UnixTimeMs,
}

impl From<&LocationSample> for LocationSnapshot {
    fn from(sample: &LocationSample) -> Self {
        Self {
            lat: sample.coordinate.lat(),
            lng: sample.coordinate.lng(),
            ts: sample.timestamp,
        }
    }
}

// --- Sessions ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Ended => f.write_str("ended"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WalkSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub contact: Contact,
    pub status: SessionStatus,
    pub started_at: UnixTimeMs,
    pub ended_at: Option<UnixTimeMs>,
}

impl WalkSession {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Elapsed walk time; measured up to `now` while the walk is still active.
    #[must_use]
    pub fn duration_ms(&self, now: UnixTimeMs) -> u64 {
        self.ended_at.unwrap_or(now).elapsed_since(self.started_at)
    }
}

/// Snapshot written once when a walk ends. Immutable afterwards except deletion.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: HistoryId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub contact: Contact,
    pub status: SessionStatus,
    pub started_at: UnixTimeMs,
    pub ended_at: Option<UnixTimeMs>,
    pub start_location: Option<LocationSnapshot>,
    pub end_location: Option<LocationSnapshot>,
    pub distance_meters: f64,
    pub duration_ms: u64,
    pub path_points: usize,
    pub help_sent: bool,
}
