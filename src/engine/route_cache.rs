use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::geo::{haversine_meters, GeoPoint};
use crate::models::location::WorkerLocation;
use crate::models::order::Order;
use crate::models::route::{RouteSnapshot, RouteView};
use crate::observability::metrics::Metrics;
use crate::routing::{RouteError, RouteProvider, RouteResult};

const INVALID_COORDINATES: &str = "invalid coordinates";

#[derive(Debug, Clone, Copy)]
pub struct RouteCacheConfig {
    pub min_distance_m: f64,
    pub max_age: Duration,
    pub query_timeout: Duration,
}

impl Default for RouteCacheConfig {
    fn default() -> Self {
        Self {
            min_distance_m: 30.0,
            max_age: Duration::from_secs(15),
            query_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// The location is unusable and there is nothing cached to fall back on.
    InvalidCoordinates,
    ServeCached,
    Compute,
}

/// Route state for one (origin, worker) pair.
///
/// Recomputes once the worker has moved more than `min_distance_m` from where
/// the current snapshot was computed, or once the snapshot is older than
/// `max_age`. Between those points the cached route is served as is.
#[derive(Debug, Clone)]
pub struct RouteCache {
    origin: GeoPoint,
    worker_id: String,
    config: RouteCacheConfig,
    snapshot: Option<RouteSnapshot>,
    last_evaluated: Option<WorkerLocation>,
    stale: bool,
    warning: Option<String>,
    error: Option<String>,
}

impl RouteCache {
    pub fn new(origin: GeoPoint, worker_id: impl Into<String>, config: RouteCacheConfig) -> Self {
        Self {
            origin,
            worker_id: worker_id.into(),
            config,
            snapshot: None,
            last_evaluated: None,
            stale: false,
            warning: None,
            error: None,
        }
    }

    pub fn origin(&self) -> GeoPoint {
        self.origin
    }

    pub fn snapshot(&self) -> Option<&RouteSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn last_evaluated(&self) -> Option<&WorkerLocation> {
        self.last_evaluated.as_ref()
    }

    pub fn decide(&mut self, location: &WorkerLocation, now: DateTime<Utc>) -> RouteDecision {
        self.last_evaluated = Some(location.clone());
        let destination = location.point();

        if destination.is_degenerate() {
            if self.snapshot.is_some() {
                return RouteDecision::ServeCached;
            }
            self.error = Some(INVALID_COORDINATES.to_string());
            return RouteDecision::InvalidCoordinates;
        }

        let Some(snapshot) = &self.snapshot else {
            return RouteDecision::Compute;
        };

        let moved_m = haversine_meters(&snapshot.computed_for, &destination);
        let age = (now - snapshot.computed_at).to_std().unwrap_or_default();
        if moved_m > self.config.min_distance_m || age > self.config.max_age {
            RouteDecision::Compute
        } else {
            RouteDecision::ServeCached
        }
    }

    pub fn record_success(
        &mut self,
        result: RouteResult,
        computed_for: GeoPoint,
        now: DateTime<Utc>,
    ) -> &RouteSnapshot {
        self.stale = false;
        self.warning = None;
        self.error = None;
        self.snapshot.insert(RouteSnapshot {
            origin: self.origin,
            dest_worker_id: self.worker_id.clone(),
            polyline: result.polyline,
            distance_meters: result.distance_meters,
            duration_seconds: result.duration_seconds,
            computed_at: now,
            computed_for,
        })
    }

    /// Keeps serving the previous snapshot, flagged stale, when there is one.
    pub fn record_failure(&mut self, err: &RouteError) {
        if self.snapshot.is_some() {
            self.stale = true;
            self.warning = Some(format!("stale route: {err}"));
            self.error = None;
        } else {
            self.error = Some(err.to_string());
        }
    }

    pub fn view(&self) -> RouteView {
        RouteView {
            snapshot: self.snapshot.clone(),
            stale: self.stale,
            warning: self.warning.clone(),
            error: self.error.clone(),
        }
    }
}

pub struct RouteTrackerHandle {
    order_id: String,
    view_rx: watch::Receiver<RouteView>,
    task: Option<JoinHandle<()>>,
}

impl RouteTrackerHandle {
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn view(&self) -> RouteView {
        self.view_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RouteView> {
        self.view_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Cancels the tracker, including any route query in flight. The cached
    /// snapshot goes with the task.
    pub async fn stop(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        task.abort();
        if let Err(err) = task.await {
            if !err.is_cancelled() {
                warn!(order_id = %self.order_id, error = %err, "route tracker task failed");
            }
        }
        true
    }
}

/// Follows one worker's location and keeps a route from the order's origin
/// to them.
pub struct RouteTracker {
    order_id: String,
    cache: RouteCache,
    provider: Arc<dyn RouteProvider>,
    metrics: Metrics,
    view_tx: watch::Sender<RouteView>,
}

impl RouteTracker {
    pub fn spawn(
        order_id: String,
        cache: RouteCache,
        provider: Arc<dyn RouteProvider>,
        location_rx: watch::Receiver<Option<WorkerLocation>>,
        order_rx: watch::Receiver<Option<Order>>,
        metrics: Metrics,
    ) -> RouteTrackerHandle {
        let (view_tx, view_rx) = watch::channel(RouteView::default());
        let tracker = RouteTracker {
            order_id: order_id.clone(),
            cache,
            provider,
            metrics,
            view_tx,
        };
        let task = tokio::spawn(tracker.run(location_rx, order_rx));

        RouteTrackerHandle {
            order_id,
            view_rx,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        mut location_rx: watch::Receiver<Option<WorkerLocation>>,
        mut order_rx: watch::Receiver<Option<Order>>,
    ) {
        self.metrics.active_route_trackers.inc();
        let _guard = GaugeGuard(self.metrics.clone());
        info!(order_id = %self.order_id, "route tracking started");

        let mut location_changed = true;
        loop {
            let finished = order_rx
                .borrow_and_update()
                .as_ref()
                .is_some_and(|order| order.status.is_terminal());
            if finished {
                break;
            }

            if location_changed {
                let location = location_rx.borrow_and_update().clone();
                if let Some(location) = location {
                    self.on_location(location).await;
                }
            }

            tokio::select! {
                changed = location_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    location_changed = true;
                }
                changed = order_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    location_changed = false;
                }
            }
        }

        info!(order_id = %self.order_id, "route tracking finished");
    }

    async fn on_location(&mut self, location: WorkerLocation) {
        match self.cache.decide(&location, Utc::now()) {
            RouteDecision::InvalidCoordinates => {
                self.count("invalid");
                debug!(order_id = %self.order_id, "worker location has no usable fix");
            }
            RouteDecision::ServeCached => {
                self.count("cached");
            }
            RouteDecision::Compute => {
                let destination = location.point();
                let started = Instant::now();
                let result = tokio::time::timeout(
                    self.cache.config.query_timeout,
                    self.provider.route(self.cache.origin(), destination),
                )
                .await
                .unwrap_or(Err(RouteError::Timeout));
                self.metrics
                    .route_query_latency_seconds
                    .observe(started.elapsed().as_secs_f64());

                match result {
                    Ok(route) => {
                        self.count("computed");
                        let snapshot = self.cache.record_success(route, destination, Utc::now());
                        debug!(
                            order_id = %self.order_id,
                            distance_m = snapshot.distance_meters,
                            duration_s = snapshot.duration_seconds,
                            "route recomputed"
                        );
                    }
                    Err(err) => {
                        self.count("failed");
                        warn!(order_id = %self.order_id, error = %err, "route query failed");
                        self.cache.record_failure(&err);
                    }
                }
            }
        }

        self.view_tx.send_replace(self.cache.view());
    }

    fn count(&self, outcome: &str) {
        self.metrics
            .route_computations_total
            .with_label_values(&[outcome])
            .inc();
    }
}

/// Keeps `active_route_trackers` honest when the task is aborted mid-query.
struct GaugeGuard(Metrics);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.active_route_trackers.dec();
    }
}
