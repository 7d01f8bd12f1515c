use geojson::{Feature, Geometry, JsonObject, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geo::distance_meters;
use crate::model::{LocationSample, UnixTimeMs};

// --- Alerts ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum AlertType {
    Started,
    NoMove,
    NoResponse,
    Emergency,
    UserSafe,
    ConnLost,
    SosFailed,
    HistoryNotSaved,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::NoMove => "noMove",
            Self::NoResponse => "noResponse",
            Self::Emergency => "emergency",
            Self::UserSafe => "userSafe",
            Self::ConnLost => "connLost",
            Self::SosFailed => "sosFailed",
            Self::HistoryNotSaved => "historyNotSaved",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub message: String,
    pub active: bool,
    pub timestamp: UnixTimeMs,
}

/// At most one alert per type. Updating a type replaces its entry in place, keeping the
/// position of the first insertion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertBook {
    alerts: Vec<Alert>,
}

impl AlertBook {
    pub fn upsert(
        &mut self,
        alert_type: AlertType,
        message: impl Into<String>,
        active: bool,
        timestamp: UnixTimeMs,
    ) {
        let alert = Alert {
            alert_type,
            message: message.into(),
            active,
            timestamp,
        };
        match self.alerts.iter_mut().find(|a| a.alert_type == alert_type) {
            Some(existing) => *existing = alert,
            None => self.alerts.push(alert),
        }
    }

    /// Marks an alert inactive, keeping its message. Returns false if there was none.
    pub fn deactivate(&mut self, alert_type: AlertType, timestamp: UnixTimeMs) -> bool {
        match self.alerts.iter_mut().find(|a| a.alert_type == alert_type) {
            Some(existing) if existing.active => {
                existing.active = false;
                existing.timestamp = timestamp;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn get(&self, alert_type: AlertType) -> Option<&Alert> {
        self.alerts.iter().find(|a| a.alert_type == alert_type)
    }

    #[must_use]
    pub fn is_active(&self, alert_type: AlertType) -> bool {
        self.get(alert_type).is_some_and(|a| a.active)
    }

    #[must_use]
    pub fn all(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn active(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| a.active)
    }
}

// --- Path ---

/// Accepted path, distance accumulator and alerts of the current session.
#[derive(Clone, Debug, Default)]
pub struct SessionStore {
    path: Vec<LocationSample>,
    distance_m: f64,
    alerts: AlertBook,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an accepted sample. Callers must have run it through the filter, which
    /// rejects anything older than the current tail.
    pub fn append(&mut self, sample: LocationSample) {
        if let Some(last) = self.path.last() {
            debug_assert!(
                !sample.timestamp.is_before(last.timestamp),
                "path append out of order: {:?} after {:?}",
                sample.timestamp,
                last.timestamp
            );
            self.distance_m += distance_meters(last.coordinate, sample.coordinate);
        }
        self.path.push(sample);
    }

    #[must_use]
    pub fn last_accepted(&self) -> Option<&LocationSample> {
        self.path.last()
    }

    #[must_use]
    pub fn first_accepted(&self) -> Option<&LocationSample> {
        self.path.first()
    }

    #[must_use]
    pub fn path(&self) -> &[LocationSample] {
        &self.path
    }

    #[must_use]
    pub fn distance_m(&self) -> f64 {
        self.distance_m
    }

    #[must_use]
    pub fn alerts(&self) -> &AlertBook {
        &self.alerts
    }

    pub fn alerts_mut(&mut self) -> &mut AlertBook {
        &mut self.alerts
    }

    /// GeoJSON feature of the path for map collaborators. A single point becomes a
    /// `Point`; an empty path has no geometry.
    #[must_use]
    pub fn to_geojson(&self) -> Feature {
        let geometry = match self.path.as_slice() {
            [] => None,
            [only] => Some(Geometry::new(Value::Point(vec![
                only.coordinate.lng(),
                only.coordinate.lat(),
            ]))),
            points => Some(Geometry::new(Value::LineString(
                points
                    .iter()
                    .map(|s| vec![s.coordinate.lng(), s.coordinate.lat()])
                    .collect(),
            ))),
        };

        let mut properties = JsonObject::new();
        properties.insert("distanceMeters".into(), serde_json::json!(self.distance_m));
        properties.insert(
            "timestamps".into(),
            serde_json::json!(self.path.iter().map(|s| s.timestamp.0).collect::<Vec<_>>()),
        );

        Feature {
            bbox: None,
            geometry,
            id: None,
            properties: Some(properties),
            foreign_members: None,
        }
    }
}
