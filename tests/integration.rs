use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use tukang_dispatch::api::rest::router;
use tukang_dispatch::audit::run_audit_writer;
use tukang_dispatch::config::Config;
use tukang_dispatch::geo::GeoPoint;
use tukang_dispatch::models::audit::AuditEntry;
use tukang_dispatch::routing::{RouteError, RouteProvider, RouteResult};
use tukang_dispatch::state::AppState;

struct StraightLine;

#[async_trait]
impl RouteProvider for StraightLine {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteResult, RouteError> {
        Ok(RouteResult {
            polyline: vec![origin, destination],
            distance_meters: tukang_dispatch::geo::haversine_meters(&origin, &destination),
            duration_seconds: 60.0,
        })
    }
}

fn setup() -> (axum::Router, Arc<AppState>, mpsc::Receiver<AuditEntry>) {
    let (state, audit_rx) = AppState::new(&Config::default(), Arc::new(StraightLine));
    let shared = Arc::new(state);
    (router(shared.clone()), shared, audit_rx)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn delete_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn create_order(app: &axum::Router) -> String {
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "customer_id": "customer-1",
                "service_category": "plumbing",
                "description": "leaking sink",
                "origin": { "lat": -6.2, "lng": 106.816666 }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    body_json(res).await["id"].as_str().unwrap().to_string()
}

async fn claim(app: &axum::Router, order_id: &str, worker_id: &str) -> Value {
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/claim"),
            json!({ "worker_id": worker_id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    body_json(res).await
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state, _rx) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["orders"], 0);
    assert_eq!(body["location_sessions"], 0);
    assert_eq!(body["route_sessions"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _state, _rx) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("active_location_trackers"));
}

#[tokio::test]
async fn create_order_starts_requested() {
    let (app, _state, _rx) = setup();
    let id = create_order(&app).await;

    let res = app
        .oneshot(get_request(&format!("/orders/{id}")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body = body_json(res).await;
    assert_eq!(body["status"], "Requested");
    assert!(body["worker_id"].is_null());
    assert_eq!(body["service_category"], "plumbing");
}

#[tokio::test]
async fn create_order_rejects_blank_customer() {
    let (app, _state, _rx) = setup();
    let res = app
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "customer_id": "  ",
                "service_category": "plumbing",
                "origin": { "lat": -6.2, "lng": 106.8 }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = body_json(res).await;
    assert!(body["error"].as_str().unwrap().contains("customer_id"));
}

#[tokio::test]
async fn get_nonexistent_order_returns_404() {
    let (app, _state, _rx) = setup();
    let response = app
        .oneshot(get_request("/orders/does-not-exist"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn second_claim_is_told_order_taken() {
    let (app, _state, _rx) = setup();
    let id = create_order(&app).await;

    let first = claim(&app, &id, "worker-a").await;
    assert_eq!(first["claimed"], true);
    assert!(first.get("reason").is_none());
    assert_eq!(first["order"]["status"], "Assigned");
    assert_eq!(first["order"]["worker_id"], "worker-a");

    let second = claim(&app, &id, "worker-b").await;
    assert_eq!(second["claimed"], false);
    assert_eq!(second["reason"], "order already taken");
    assert_eq!(second["order"]["worker_id"], "worker-a");
}

#[tokio::test]
async fn claim_missing_order_returns_404() {
    let (app, _state, _rx) = setup();
    let res = app
        .oneshot(json_request(
            "POST",
            "/orders/missing/claim",
            json!({ "worker_id": "worker-a" }),
        ))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn transition_follows_table() {
    let (app, _state, _rx) = setup();
    let id = create_order(&app).await;
    claim(&app, &id, "worker-a").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{id}/transition"),
            json!({ "status": "InProgress" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "InProgress");
    assert!(!body["started_at"].is_null());

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{id}/transition"),
            json!({ "status": "Done" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(!body_json(res).await["completed_at"].is_null());

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{id}/transition"),
            json!({ "status": "Cancelled" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = app
        .oneshot(get_request(&format!("/orders/{id}")))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["status"], "Done");
}

#[tokio::test]
async fn transition_to_assigned_is_rejected() {
    let (app, _state, _rx) = setup();
    let id = create_order(&app).await;

    let res = app
        .oneshot(json_request(
            "POST",
            &format!("/orders/{id}/transition"),
            json!({ "status": "Assigned" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_orders_filters_by_status_and_worker() {
    let (app, _state, _rx) = setup();
    let open = create_order(&app).await;
    let taken = create_order(&app).await;
    claim(&app, &taken, "worker-a").await;

    let res = app
        .clone()
        .oneshot(get_request("/orders?status=Requested"))
        .await
        .unwrap();
    let body = body_json(res).await;
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|order| order["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![open.as_str()]);

    let res = app
        .oneshot(get_request("/orders?worker_id=worker-a"))
        .await
        .unwrap();
    let body = body_json(res).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], taken);
}

#[tokio::test]
async fn location_tracking_lifecycle() {
    let (app, _state, _rx) = setup();
    let id = create_order(&app).await;
    claim(&app, &id, "worker-a").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/workers/worker-a/tracking",
            json!({ "order_id": id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["order_id"], id);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/workers/worker-a/samples",
            json!({ "lat": -6.21, "lng": 106.82 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    wait_for("first location write", || {
        let app = app.clone();
        async move {
            let res = app
                .oneshot(get_request("/workers/worker-a/tracking"))
                .await
                .unwrap();
            body_json(res).await["executed"] == 1
        }
    })
    .await;

    let res = app
        .clone()
        .oneshot(get_request("/workers/worker-a/location"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["online_status"], "Online");
    assert_eq!(body["latitude"], -6.21);

    let res = app
        .clone()
        .oneshot(delete_request("/workers/worker-a/tracking"))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["stopped"], true);

    let res = app
        .clone()
        .oneshot(delete_request("/workers/worker-a/tracking"))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["stopped"], false);

    let res = app
        .oneshot(get_request("/workers/worker-a/location"))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["online_status"], "Offline");
}

#[tokio::test]
async fn tracking_rejects_worker_not_on_order() {
    let (app, _state, _rx) = setup();
    let id = create_order(&app).await;
    claim(&app, &id, "worker-a").await;

    let res = app
        .oneshot(json_request(
            "POST",
            "/workers/worker-b/tracking",
            json!({ "order_id": id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn sample_with_bad_coordinates_is_rejected() {
    let (app, _state, _rx) = setup();
    let id = create_order(&app).await;
    claim(&app, &id, "worker-a").await;
    app.clone()
        .oneshot(json_request(
            "POST",
            "/workers/worker-a/tracking",
            json!({ "order_id": id }),
        ))
        .await
        .unwrap();

    let res = app
        .oneshot(json_request(
            "POST",
            "/workers/worker-a/samples",
            json!({ "lat": 0.0, "lng": 0.0 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn route_tracking_computes_once_location_is_known() {
    let (app, _state, _rx) = setup();
    let id = create_order(&app).await;

    let res = app
        .clone()
        .oneshot(json_request("POST", &format!("/orders/{id}/route"), json!({})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    claim(&app, &id, "worker-a").await;
    app.clone()
        .oneshot(json_request(
            "POST",
            "/workers/worker-a/tracking",
            json!({ "order_id": id }),
        ))
        .await
        .unwrap();
    app.clone()
        .oneshot(json_request(
            "POST",
            "/workers/worker-a/samples",
            json!({ "lat": -6.25, "lng": 106.85 }),
        ))
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(json_request("POST", &format!("/orders/{id}/route"), json!({})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    wait_for("route snapshot", || {
        let app = app.clone();
        let uri = format!("/orders/{id}/route");
        async move {
            let res = app.oneshot(get_request(&uri)).await.unwrap();
            !body_json(res).await["snapshot"].is_null()
        }
    })
    .await;

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{id}/route")))
        .await
        .unwrap();
    let body = body_json(res).await;
    assert_eq!(body["stale"], false);
    assert_eq!(body["snapshot"]["dest_worker_id"], "worker-a");
    assert_eq!(body["snapshot"]["polyline"].as_array().unwrap().len(), 2);

    let res = app
        .clone()
        .oneshot(delete_request(&format!("/orders/{id}/route")))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["stopped"], true);

    let res = app
        .oneshot(get_request(&format!("/orders/{id}/route")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_stops_counting_sessions_once_the_order_is_cancelled() {
    let (app, _state, _rx) = setup();
    let id = create_order(&app).await;
    claim(&app, &id, "worker-a").await;
    app.clone()
        .oneshot(json_request(
            "POST",
            "/workers/worker-a/tracking",
            json!({ "order_id": id }),
        ))
        .await
        .unwrap();
    app.clone()
        .oneshot(json_request("POST", &format!("/orders/{id}/route"), json!({})))
        .await
        .unwrap();

    let res = app.clone().oneshot(get_request("/health")).await.unwrap();
    let body = body_json(res).await;
    assert_eq!(body["location_sessions"], 1);
    assert_eq!(body["route_sessions"], 1);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{id}/transition"),
            json!({ "status": "Cancelled" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    wait_for("sessions to end", || {
        let app = app.clone();
        async move {
            let body = body_json(app.oneshot(get_request("/health")).await.unwrap()).await;
            body["location_sessions"] == 0 && body["route_sessions"] == 0
        }
    })
    .await;

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{id}/route")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app
        .oneshot(delete_request("/workers/worker-a/tracking"))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["stopped"], false);
}

#[tokio::test]
async fn audit_endpoint_lists_recorded_operations() {
    let (app, state, audit_rx) = setup();
    tokio::spawn(run_audit_writer(state.audit_log.clone(), audit_rx));

    let id = create_order(&app).await;
    claim(&app, &id, "worker-a").await;
    claim(&app, &id, "worker-b").await;

    wait_for("claim audit entries", || {
        let app = app.clone();
        async move {
            let res = app.oneshot(get_request("/audit")).await.unwrap();
            let body = body_json(res).await;
            body.as_array()
                .unwrap()
                .iter()
                .filter(|entry| entry["operation"] == "claim")
                .count()
                == 2
        }
    })
    .await;

    let res = app.oneshot(get_request("/audit")).await.unwrap();
    let body = body_json(res).await;
    let outcomes: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .filter(|entry| entry["operation"] == "claim")
        .map(|entry| entry["outcome"].as_str().unwrap())
        .collect();
    assert_eq!(outcomes, vec!["ok", "rejected"]);
}
