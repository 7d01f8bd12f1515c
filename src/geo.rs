use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::EARTH_RADIUS_M;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

/// WGS84 position in degrees. Only constructible through validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
struct RawCoordinate {
    lat: f64,
    lng: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = CoordinateError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Self::new(raw.lat, raw.lng)
    }
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(CoordinateError::LongitudeOutOfRange(lng));
        }
        Ok(Self { lat, lng })
    }

    #[must_use]
    pub const fn lat(self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn lng(self) -> f64 {
        self.lng
    }

    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        distance_meters(self, other)
    }

    /// Moves the point by the given metres along north and east, using a local
    /// spherical approximation. Used by the walk simulator and in tests.
    pub fn offset_meters(self, north_m: f64, east_m: f64) -> Result<Self, CoordinateError> {
        let dlat = (north_m / EARTH_RADIUS_M).to_degrees();
        let cos_lat = self.lat.to_radians().cos().max(1e-12);
        let dlng = (east_m / (EARTH_RADIUS_M * cos_lat)).to_degrees();
        Self::new(self.lat + dlat, self.lng + dlng)
    }
}

impl TryFrom<(f64, f64)> for Coordinate {
    type Error = CoordinateError;

    fn try_from((lat, lng): (f64, f64)) -> Result<Self, Self::Error> {
        Self::new(lat, lng)
    }
}

/// Great-circle distance in metres.
#[must_use]
pub fn distance_meters(a: Coordinate, b: Coordinate) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (a.lat - b.lat).abs() < EPSILON && (a.lng - b.lng).abs() < EPSILON {
        return 0.0;
    }

    let lat1_rad = a.lat.to_radians();
    let lat2_rad = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);

    let h = h.clamp(0.0, 1.0);

    let c = 2.0 * h.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Maps search link for a coordinate, e.g. for the SOS text.
#[must_use]
pub fn maps_link(base: &Url, at: Coordinate) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .append_pair("api", "1")
        .append_pair("query", &format!("{:.6},{:.6}", at.lat, at.lng));
    url
}
