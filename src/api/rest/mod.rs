pub mod orders;
pub mod workers;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::models::audit::AuditEntry;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(orders::router())
        .merge(workers::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/audit", get(audit))
        .route("/ws/orders", get(ws::feed_handler))
        .route("/ws/orders/:id", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    orders: usize,
    worker_locations: usize,
    location_sessions: usize,
    route_sessions: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        orders: state.orders.len(),
        worker_locations: state.locations.len(),
        location_sessions: state.dispatcher.active_location_sessions(),
        route_sessions: state.dispatcher.active_route_sessions(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}

async fn audit(State(state): State<Arc<AppState>>) -> Json<Vec<AuditEntry>> {
    Json(state.audit_log.recent())
}
