use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::ledger::NewOrder;
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::order::{Order, OrderStatus};
use crate::models::route::RouteView;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/claim", post(claim_order))
        .route("/orders/:id/transition", post(transition_order))
        .route(
            "/orders/:id/route",
            post(start_route).get(get_route).delete(stop_route),
        )
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: String,
    pub service_category: String,
    #[serde(default)]
    pub description: String,
    pub origin: GeoPoint,
}

#[derive(Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<OrderStatus>,
    pub worker_id: Option<String>,
    pub customer_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
}

#[derive(Serialize)]
pub struct ClaimResponse {
    pub claimed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub order: Order,
}

#[derive(Deserialize)]
pub struct TransitionRequest {
    pub status: OrderStatus,
}

#[derive(Serialize)]
pub struct StoppedResponse {
    pub stopped: bool,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .dispatcher
        .ledger()
        .create_order(NewOrder {
            customer_id: payload.customer_id,
            service_category: payload.service_category,
            description: payload.description,
            origin: payload.origin,
        })
        .await?;

    Ok(Json(order))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    let ledger = state.dispatcher.ledger();
    let orders = match (&query.worker_id, &query.customer_id) {
        (Some(worker_id), _) => ledger.orders_for_worker(worker_id).await?,
        (None, Some(customer_id)) => ledger.orders_for_customer(customer_id).await?,
        (None, None) => ledger.list(query.status).await?,
    };

    let orders = orders
        .into_iter()
        .filter(|order| query.status.is_none_or(|status| order.status == status))
        .collect();
    Ok(Json(orders))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatcher.ledger().get(&id).await?))
}

async fn claim_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, AppError> {
    let claimed = state.dispatcher.claim(&id, &payload.worker_id).await?;
    let order = state.dispatcher.ledger().get(&id).await?;

    Ok(Json(ClaimResponse {
        claimed,
        reason: (!claimed).then_some("order already taken"),
        order,
    }))
}

async fn transition_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<TransitionRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state.dispatcher.transition(&id, payload.status).await?;
    Ok(Json(order))
}

async fn start_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RouteView>, AppError> {
    Ok(Json(state.dispatcher.start_route_tracking(&id).await?))
}

async fn get_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RouteView>, AppError> {
    Ok(Json(state.dispatcher.route_view(&id)?))
}

async fn stop_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<StoppedResponse> {
    Json(StoppedResponse {
        stopped: state.dispatcher.stop_route_tracking(&id).await,
    })
}
