// lib.rs - Walk companion safety monitor core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

//! Safety core of a "walk with me" companion.
//!
//! A user starts a monitored walk naming a trusted contact. Location samples are filtered
//! for GPS drift, immobility raises an "are you safe?" countdown, and an unanswered or
//! refused check sends a single SOS text to the contact. Ending the walk produces an
//! immutable [`HistoryRecord`].
//!
//! The core is a Crux app, [`monitor::App`], that requests location updates, timers, SMS
//! and history writes as capability effects. [`runtime::MonitorHandle`] is its shell: a
//! tokio task that performs those effects with the platform [`Services`].

pub mod capabilities;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod geo;
pub mod immobility;
pub mod lifecycle;
pub mod model;
pub mod monitor;
pub mod notifier;
pub mod runtime;
pub mod safety_check;
pub mod store;

use std::time::Duration;

pub use capabilities::{Capabilities, Services};
pub use config::{MonitorConfig, SmsGatewayConfig};
pub use error::{AppError, ErrorKind, MonitorError, Rejection, SosError};
pub use event::{Effect, Event, SosReason};
pub use geo::{distance_meters, Coordinate, CoordinateError};
pub use model::{
    Contact, HistoryId, HistoryRecord, LocationSample, PhoneNumber, SessionId, SessionStatus,
    UnixTimeMs, UserId, WalkSession,
};
pub use monitor::{App, Model, MonitorView};
pub use runtime::MonitorHandle;
pub use store::{Alert, AlertType};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const MIN_DISTANCE_THRESHOLD_M: f64 = 5.0;
pub const MIN_MOVING_SPEED_MPS: f64 = 0.3;
pub const JUMP_DISTANCE_M: f64 = 12.0;
pub const NO_MOVE_DISTANCE_M: f64 = 10.0;
pub const NO_MOVE_WINDOW: Duration = Duration::from_millis(30_000);
pub const IMMOBILITY_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const COUNTDOWN_SECS: u32 = 10;
pub const COUNTDOWN_TICK: Duration = Duration::from_secs(1);
pub const SMS_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAPS_BASE_URL: &str = "https://www.google.com/maps/search/";
pub const MAILBOX_CAPACITY: usize = 256;
