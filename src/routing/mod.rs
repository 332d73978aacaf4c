//! External route queries.

pub mod osrm;

use async_trait::async_trait;
use thiserror::Error;

use crate::geo::GeoPoint;

pub use osrm::OsrmRouteProvider;

#[derive(Debug, Clone, PartialEq)]
pub struct RouteResult {
    pub polyline: Vec<GeoPoint>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RouteError {
    #[error("route query timed out")]
    Timeout,

    #[error("route service returned no route")]
    EmptyResult,

    #[error("route service error: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteResult, RouteError>;
}
