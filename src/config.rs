use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::{
    COUNTDOWN_SECS, COUNTDOWN_TICK, DEFAULT_MAPS_BASE_URL, IMMOBILITY_POLL_INTERVAL,
    JUMP_DISTANCE_M, MIN_DISTANCE_THRESHOLD_M, MIN_MOVING_SPEED_MPS, NO_MOVE_DISTANCE_M,
    NO_MOVE_WINDOW, SMS_TIMEOUT,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("could not parse configuration: {0}")]
    Parse(String),
}

/// Tunable thresholds of the safety monitor.
///
/// The drift filter and the immobility anchor use independent distances; neither value is
/// assumed to be tuned correctly, so both are exposed here.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// A candidate closer than this to the last accepted point is drift.
    pub min_distance_m: f64,
    /// Reported speed above which a small move counts as real.
    pub min_speed_mps: f64,
    /// Distance above which a move is accepted regardless of speed.
    pub jump_distance_m: f64,
    /// Distance from the immobility anchor that counts as relocating.
    pub no_move_distance_m: f64,
    pub no_move_window_ms: u64,
    pub poll_interval_ms: u64,
    pub countdown_secs: u32,
    pub countdown_tick_ms: u64,
    pub sms_timeout_ms: u64,
    pub maps_base_url: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self {
            min_distance_m: MIN_DISTANCE_THRESHOLD_M,
            min_speed_mps: MIN_MOVING_SPEED_MPS,
            jump_distance_m: JUMP_DISTANCE_M,
            no_move_distance_m: NO_MOVE_DISTANCE_M,
            no_move_window_ms: NO_MOVE_WINDOW.as_millis() as u64,
            poll_interval_ms: IMMOBILITY_POLL_INTERVAL.as_millis() as u64,
            countdown_secs: COUNTDOWN_SECS,
            countdown_tick_ms: COUNTDOWN_TICK.as_millis() as u64,
            sms_timeout_ms: SMS_TIMEOUT.as_millis() as u64,
            maps_base_url: DEFAULT_MAPS_BASE_URL.to_string(),
        }
    }
}

impl MonitorConfig {
    /// Parses a JSON document; missing fields fall back to the defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("min_distance_m", self.min_distance_m),
            ("min_speed_mps", self.min_speed_mps),
            ("jump_distance_m", self.jump_distance_m),
            ("no_move_distance_m", self.no_move_distance_m),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{name} must be a finite, non-negative number"
                )));
            }
        }
        if self.jump_distance_m < self.min_distance_m {
            return Err(ConfigError::Validation(
                "jump_distance_m must be >= min_distance_m".into(),
            ));
        }
        if self.no_move_window_ms == 0 {
            return Err(ConfigError::Validation("no_move_window_ms must be > 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation("poll_interval_ms must be > 0".into()));
        }
        if self.countdown_secs == 0 {
            return Err(ConfigError::Validation("countdown_secs must be > 0".into()));
        }
        if self.countdown_tick_ms == 0 {
            return Err(ConfigError::Validation("countdown_tick_ms must be > 0".into()));
        }
        if self.sms_timeout_ms < 1000 {
            return Err(ConfigError::Validation(
                "sms_timeout_ms should be at least 1000ms".into(),
            ));
        }
        self.maps_base_url()?;
        Ok(())
    }

    pub fn maps_base_url(&self) -> Result<Url, ConfigError> {
        parse_http_url(&self.maps_base_url)
    }

    #[must_use]
    pub const fn no_move_window(&self) -> Duration {
        Duration::from_millis(self.no_move_window_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }

    #[must_use]
    pub const fn countdown_duration(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms.saturating_mul(self.countdown_secs as u64))
    }

    #[must_use]
    pub const fn sms_timeout(&self) -> Duration {
        Duration::from_millis(self.sms_timeout_ms)
    }
}

/// Settings for [`crate::capabilities::HttpSmsGateway`].
#[derive(Clone, Debug, Deserialize)]
pub struct SmsGatewayConfig {
    pub endpoint: String,
    pub api_token: SecretString,
    #[serde(default)]
    pub sender_id: Option<String>,
}

impl SmsGatewayConfig {
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let url = parse_http_url(&self.endpoint)?;
        if url.scheme() != "https" {
            return Err(ConfigError::InvalidUrl {
                url: self.endpoint.clone(),
                reason: "SMS gateway must use https".into(),
            });
        }
        if let Some(sender) = &self.sender_id {
            if sender.is_empty() || sender.len() > 11 {
                return Err(ConfigError::Validation(
                    "sender_id must be 1-11 characters".into(),
                ));
            }
        }
        Ok(url)
    }
}

fn parse_http_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("invalid scheme '{}', only 'http' and 'https' are allowed", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "URL must have a host".into(),
        });
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "credentials in URL are not allowed".into(),
        });
    }
    Ok(url)
}
