use crate::config::MonitorConfig;
use crate::geo::distance_meters;
use crate::model::LocationSample;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    /// Too small a move to be anything but GPS noise.
    Jitter { distance_m: f64 },
    /// Older than the last accepted sample; accepting it would reorder the path.
    OutOfOrder,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    #[must_use]
    pub const fn is_accept(self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Path drift filter. Decides whether a raw sample is genuine movement relative to the
/// last accepted sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFilter {
    min_distance_m: f64,
    min_speed_mps: f64,
    jump_distance_m: f64,
}

impl Default for LocationFilter {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

impl LocationFilter {
    #[must_use]
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            min_distance_m: config.min_distance_m,
            min_speed_mps: config.min_speed_mps,
            jump_distance_m: config.jump_distance_m,
        }
    }

    #[must_use]
    pub fn classify(&self, last: Option<&LocationSample>, candidate: &LocationSample) -> Verdict {
        let Some(last) = last else {
            return Verdict::Accept;
        };

        if candidate.timestamp.is_before(last.timestamp) {
            return Verdict::Reject(RejectReason::OutOfOrder);
        }

        let d = distance_meters(last.coordinate, candidate.coordinate);
        let moving = candidate.speed_mps > self.min_speed_mps || d > self.jump_distance_m;

        if d > self.min_distance_m && moving {
            Verdict::Accept
        } else {
            Verdict::Reject(RejectReason::Jitter { distance_m: d })
        }
    }
}
