use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteSnapshot {
    pub origin: GeoPoint,
    pub dest_worker_id: String,
    pub polyline: Vec<GeoPoint>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
    pub computed_at: DateTime<Utc>,
    pub computed_for: GeoPoint,
}

/// What subscribers of a route tracker see after each location change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteView {
    pub snapshot: Option<RouteSnapshot>,
    pub stale: bool,
    pub warning: Option<String>,
    pub error: Option<String>,
}
