use serde::{Deserialize, Serialize};

use crate::error::AppError;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// The platform reports (0, 0) when it has no fix yet.
    pub fn is_degenerate(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(AppError::InvalidArgument(
                "coordinates must be finite".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::InvalidArgument(format!(
                "coordinates out of range: ({}, {})",
                self.lat, self.lng
            )));
        }
        if self.is_degenerate() {
            return Err(AppError::InvalidArgument(
                "degenerate coordinates (0, 0)".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn haversine_meters(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_M * central_angle
}

/// Offsets `origin` northwards by roughly `meters`. Handy for building samples
/// at a known distance.
pub fn offset_north(origin: &GeoPoint, meters: f64) -> GeoPoint {
    let delta_lat = (meters / EARTH_RADIUS_M).to_degrees();
    GeoPoint {
        lat: origin.lat + delta_lat,
        lng: origin.lng,
    }
}
