use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::rest::orders::StoppedResponse;
use crate::engine::reporter::ReporterStats;
use crate::error::AppError;
use crate::models::location::{PositionSample, WorkerLocation};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/workers/:id/tracking",
            post(start_tracking).get(tracking_stats).delete(stop_tracking),
        )
        .route("/workers/:id/samples", post(submit_sample))
        .route("/workers/:id/location", get(get_location))
}

#[derive(Deserialize)]
pub struct StartTrackingRequest {
    pub order_id: String,
}

#[derive(Deserialize)]
pub struct SampleRequest {
    pub lat: f64,
    pub lng: f64,
    /// Device time of the fix; defaults to arrival time.
    pub timestamp: Option<DateTime<Utc>>,
}

async fn start_tracking(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    Json(payload): Json<StartTrackingRequest>,
) -> Result<Json<ReporterStats>, AppError> {
    let stats = state
        .dispatcher
        .start_location_tracking(&worker_id, &payload.order_id)
        .await?;
    Ok(Json(stats))
}

async fn tracking_stats(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Result<Json<ReporterStats>, AppError> {
    Ok(Json(state.dispatcher.reporter_stats(&worker_id)?))
}

async fn stop_tracking(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Json<StoppedResponse> {
    Json(StoppedResponse {
        stopped: state.dispatcher.stop_location_tracking(&worker_id).await,
    })
}

async fn submit_sample(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    Json(payload): Json<SampleRequest>,
) -> Result<StatusCode, AppError> {
    let sample = PositionSample {
        lat: payload.lat,
        lng: payload.lng,
        timestamp: payload.timestamp.unwrap_or_else(Utc::now),
    };
    state.dispatcher.submit_sample(&worker_id, sample).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_location(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Result<Json<WorkerLocation>, AppError> {
    Ok(Json(state.dispatcher.worker_location(&worker_id).await?))
}
