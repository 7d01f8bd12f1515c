use crate::config::MonitorConfig;
use crate::geo::{distance_meters, Coordinate};
use crate::model::UnixTimeMs;

/// Watches how long the walker has stayed within `no_move_distance_m` of an anchor.
///
/// Uses its own distance threshold, independent of the path drift filter, and sees every
/// raw sample whether or not the filter accepted it.
#[derive(Debug, Clone)]
pub struct ImmobilityDetector {
    no_move_distance_m: f64,
    no_move_window_ms: u64,
    anchor: Option<Coordinate>,
    last_move: UnixTimeMs,
    triggered: bool,
}

impl ImmobilityDetector {
    #[must_use]
    pub fn new(config: &MonitorConfig, now: UnixTimeMs) -> Self {
        Self {
            no_move_distance_m: config.no_move_distance_m,
            no_move_window_ms: config.no_move_window_ms,
            anchor: None,
            last_move: now,
            triggered: false,
        }
    }

    /// Feeds a raw sample position. Returns true when the anchor moved.
    pub fn observe(&mut self, at: Coordinate, now: UnixTimeMs) -> bool {
        match self.anchor {
            None => {
                self.anchor = Some(at);
                self.last_move = now;
                true
            }
            Some(anchor) if distance_meters(anchor, at) > self.no_move_distance_m => {
                self.anchor = Some(at);
                self.last_move = now;
                self.triggered = false;
                true
            }
            Some(_) => false,
        }
    }

    /// Periodic check. Returns true exactly once per crossing of the immobility window;
    /// the latch clears on relocation or on [`Self::reset_clock`].
    pub fn poll(&mut self, now: UnixTimeMs) -> bool {
        if self.triggered || self.stay_duration_ms(now) <= self.no_move_window_ms {
            return false;
        }
        self.triggered = true;
        true
    }

    /// Manual "I'm safe": restart the clock without moving the anchor.
    pub fn reset_clock(&mut self, now: UnixTimeMs) {
        self.last_move = now;
        self.triggered = false;
    }

    #[must_use]
    pub fn stay_duration_ms(&self, now: UnixTimeMs) -> u64 {
        now.elapsed_since(self.last_move)
    }

    #[must_use]
    pub fn anchor(&self) -> Option<Coordinate> {
        self.anchor
    }

    #[must_use]
    pub fn last_move(&self) -> UnixTimeMs {
        self.last_move
    }
}
