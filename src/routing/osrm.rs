use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{RouteError, RouteProvider, RouteResult};
use crate::error::AppError;
use crate::geo::GeoPoint;

/// Client for an OSRM-compatible `/route/v1/driving` endpoint.
#[derive(Debug, Clone)]
pub struct OsrmRouteProvider {
    client: Client,
    base_url: String,
}

impl OsrmRouteProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Internal(format!("failed to build route client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn route_url(&self, origin: &GeoPoint, destination: &GeoPoint) -> String {
        format!(
            "{}/route/v1/driving/{},{};{},{}?overview=full&geometries=geojson",
            self.base_url.trim_end_matches('/'),
            origin.lng,
            origin.lat,
            destination.lng,
            destination.lat
        )
    }
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
    geometry: OsrmGeometry,
}

#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    /// `[lng, lat]` pairs.
    coordinates: Vec<[f64; 2]>,
}

fn into_route(response: OsrmResponse) -> Result<RouteResult, RouteError> {
    match response.code.as_str() {
        "Ok" => {}
        "NoRoute" | "NoSegment" => return Err(RouteError::EmptyResult),
        other => {
            return Err(RouteError::Upstream(format!(
                "{other}: {}",
                response.message.unwrap_or_default()
            )));
        }
    }

    let route = response
        .routes
        .into_iter()
        .next()
        .ok_or(RouteError::EmptyResult)?;
    if route.geometry.coordinates.is_empty() {
        return Err(RouteError::EmptyResult);
    }

    Ok(RouteResult {
        polyline: route
            .geometry
            .coordinates
            .into_iter()
            .map(|[lng, lat]| GeoPoint { lat, lng })
            .collect(),
        distance_meters: route.distance,
        duration_seconds: route.duration,
    })
}

#[async_trait]
impl RouteProvider for OsrmRouteProvider {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteResult, RouteError> {
        let url = self.route_url(&origin, &destination);
        debug!(url = %url, "querying route service");

        let response = self.client.get(&url).send().await.map_err(|err| {
            if err.is_timeout() {
                RouteError::Timeout
            } else {
                RouteError::Upstream(err.to_string())
            }
        })?;

        // OSRM answers "no route" with a 400 and a JSON body, so parse the
        // body before judging the status.
        let status = response.status();
        let body: OsrmResponse = response.json().await.map_err(|err| {
            if err.is_timeout() {
                RouteError::Timeout
            } else {
                RouteError::Upstream(format!("status {status}: {err}"))
            }
        })?;

        into_route(body)
    }
}
