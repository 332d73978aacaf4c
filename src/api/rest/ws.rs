use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::models::location::WorkerLocation;
use crate::models::order::{Order, OrderStatus};
use crate::models::route::RouteView;
use crate::state::AppState;

const ROUTE_LOOKUP_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_BUFFER: usize = 32;

/// One push to a client following an order.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OrderEvent {
    Order(Order),
    Location(WorkerLocation),
    Route(RouteView),
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(order_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, order_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, order_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);

    info!(order_id = %order_id, "websocket client connected");

    let follow_task = tokio::spawn(follow_order(state, order_id.clone(), events_tx));

    let send_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if !send_event(&mut sender, &event).await {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
    follow_task.abort();

    info!(order_id = %order_id, "websocket client disconnected");
}

/// Pushes the order, its worker's location and its route view into `events`
/// whenever one of them changes. Returns once the receiving side is gone.
///
/// Route tracking can start after the client connects, so the tracker is
/// looked up again at most once per lookup interval while there is none. A
/// tracker that has ended is not looked up again until the next lookup tick.
pub async fn follow_order(
    state: Arc<AppState>,
    order_id: String,
    events: mpsc::Sender<OrderEvent>,
) {
    let dispatcher = &state.dispatcher;
    let mut order_rx = dispatcher.watch_order(&order_id);
    let mut location_rx: Option<watch::Receiver<Option<WorkerLocation>>> = None;
    let mut route_rx: Option<watch::Receiver<RouteView>> = None;
    let mut route_lookup = tokio::time::interval(ROUTE_LOOKUP_INTERVAL);

    let mut order_dirty = true;
    let mut location_dirty = false;
    let mut route_dirty = false;
    let mut lookup_due = true;

    loop {
        if order_dirty {
            let order = order_rx.borrow_and_update().clone();
            if let Some(order) = order {
                if location_rx.is_none() {
                    if let Some(worker_id) = &order.worker_id {
                        location_rx = Some(dispatcher.watch_location(worker_id));
                        location_dirty = true;
                    }
                }
                if events.send(OrderEvent::Order(order)).await.is_err() {
                    return;
                }
            }
        }

        if route_rx.is_none() && lookup_due {
            if let Some(rx) = dispatcher.watch_route(&order_id) {
                route_rx = Some(rx);
                route_dirty = true;
            }
        }

        if location_dirty {
            let location = location_rx
                .as_mut()
                .and_then(|rx| rx.borrow_and_update().clone());
            if let Some(location) = location {
                if events.send(OrderEvent::Location(location)).await.is_err() {
                    return;
                }
            }
        }

        if route_dirty {
            let view = route_rx.as_mut().map(|rx| rx.borrow_and_update().clone());
            if let Some(view) = view {
                if events.send(OrderEvent::Route(view)).await.is_err() {
                    return;
                }
            }
        }

        order_dirty = false;
        location_dirty = false;
        route_dirty = false;
        lookup_due = false;

        tokio::select! {
            changed = order_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                order_dirty = true;
            }
            changed = changed_opt(&mut location_rx) => {
                if changed {
                    location_dirty = true;
                } else {
                    location_rx = None;
                }
            }
            changed = changed_opt(&mut route_rx) => {
                if changed {
                    route_dirty = true;
                } else {
                    route_rx = None;
                }
            }
            _ = route_lookup.tick() => lookup_due = true,
            _ = events.closed() => return,
        }
    }
}

#[derive(Deserialize)]
pub struct FeedQuery {
    pub status: Option<OrderStatus>,
}

/// Every committed order change, optionally narrowed to one status. Workers
/// use `?status=Requested` as their board of open jobs.
pub async fn feed_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<FeedQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_feed(socket, state, query.status))
}

async fn handle_feed(socket: WebSocket, state: Arc<AppState>, status: Option<OrderStatus>) {
    let (mut sender, mut receiver) = socket.split();
    let mut feed = Box::pin(order_feed(state.dispatcher.ledger().changes(), status));

    info!(status = ?status, "order feed client connected");

    let send_task = tokio::spawn(async move {
        while let Some(order) = feed.next().await {
            if !send_event(&mut sender, &OrderEvent::Order(order)).await {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("order feed client disconnected");
}

/// Committed orders from `changes`, keeping only those in `status` when set.
/// A lagging subscriber skips what it missed and carries on.
pub fn order_feed(
    changes: broadcast::Receiver<Order>,
    status: Option<OrderStatus>,
) -> impl Stream<Item = Order> {
    tokio_stream::StreamExt::filter_map(BroadcastStream::new(changes), move |result| {
        match result {
            Ok(order) if status.is_none_or(|status| order.status == status) => Some(order),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "order feed client lagging, events dropped");
                None
            }
        }
    })
}

async fn send_event(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    event: &OrderEvent,
) -> bool {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to serialize order event for ws");
            return true;
        }
    };
    sender.send(Message::Text(json)).await.is_ok()
}

async fn changed_opt<T>(rx: &mut Option<watch::Receiver<T>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}
