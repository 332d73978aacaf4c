use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::audit::AuditSink;
use crate::engine::ledger::OrderLedger;
use crate::engine::reporter::{submit_sample, LocationReporter, ReporterHandle, ReporterStats, ThrottleConfig};
use crate::engine::route_cache::{RouteCache, RouteCacheConfig, RouteTracker, RouteTrackerHandle};
use crate::error::AppError;
use crate::models::audit::{AuditEntry, AuditOutcome};
use crate::models::location::{PositionSample, WorkerLocation};
use crate::models::order::{Order, OrderStatus};
use crate::models::route::RouteView;
use crate::observability::metrics::Metrics;
use crate::routing::RouteProvider;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy)]
pub struct TrackingSettings {
    pub throttle: ThrottleConfig,
    pub route: RouteCacheConfig,
    pub sample_channel_size: usize,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            throttle: ThrottleConfig::default(),
            route: RouteCacheConfig::default(),
            sample_channel_size: 64,
        }
    }
}

/// Wires worker-side location reporting and customer-side route tracking to
/// the order ledger. Each session is an owned task handle kept here until it
/// is stopped or, once it has ended by itself, reaped.
pub struct Dispatcher {
    ledger: OrderLedger,
    locations: Arc<dyn DocumentStore<WorkerLocation>>,
    routes: Arc<dyn RouteProvider>,
    audit: AuditSink,
    metrics: Metrics,
    settings: TrackingSettings,
    reporters: DashMap<String, ReporterHandle>,
    route_trackers: DashMap<String, RouteTrackerHandle>,
}

impl Dispatcher {
    pub fn new(
        ledger: OrderLedger,
        locations: Arc<dyn DocumentStore<WorkerLocation>>,
        routes: Arc<dyn RouteProvider>,
        audit: AuditSink,
        metrics: Metrics,
        settings: TrackingSettings,
    ) -> Self {
        Self {
            ledger,
            locations,
            routes,
            audit,
            metrics,
            settings,
            reporters: DashMap::new(),
            route_trackers: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub async fn claim(&self, order_id: &str, worker_id: &str) -> Result<bool, AppError> {
        self.ledger.claim(order_id, worker_id).await
    }

    pub async fn transition(&self, order_id: &str, next: OrderStatus) -> Result<Order, AppError> {
        self.ledger.transition(order_id, next).await
    }

    /// Starts sampling for `worker_id` while they service `order_id`. A
    /// session already running for the worker is stopped first.
    pub async fn start_location_tracking(
        &self,
        worker_id: &str,
        order_id: &str,
    ) -> Result<ReporterStats, AppError> {
        let order = self.ledger.get(order_id).await?;
        if order.worker_id.as_deref() != Some(worker_id) {
            return Err(AppError::Conflict(format!(
                "order {order_id} is not assigned to worker {worker_id}"
            )));
        }
        if order.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "order {order_id} is already {:?}",
                order.status
            )));
        }

        self.reap_finished();
        self.stop_location_tracking(worker_id).await;

        let handle = LocationReporter::spawn(
            worker_id.to_string(),
            order_id.to_string(),
            self.locations.clone(),
            Some(self.ledger.watch(order_id)),
            self.settings.throttle,
            self.settings.sample_channel_size,
            self.metrics.clone(),
            self.audit.clone(),
        );
        let stats = handle.stats();
        self.reporters.insert(worker_id.to_string(), handle);
        Ok(stats)
    }

    pub async fn submit_sample(&self, worker_id: &str, sample: PositionSample) -> Result<(), AppError> {
        let samples_tx = self
            .reporters
            .get(worker_id)
            .map(|handle| handle.samples())
            .ok_or_else(|| AppError::NotFound(format!("worker {worker_id} is not being tracked")))?;
        submit_sample(&samples_tx, sample).await
    }

    /// Returns false when the worker was not being tracked, including when
    /// the session already ended with its order. The offline write happens
    /// once per session no matter how often this is called.
    pub async fn stop_location_tracking(&self, worker_id: &str) -> bool {
        let Some((_, mut handle)) = self.reporters.remove(worker_id) else {
            return false;
        };
        let was_live = !handle.is_finished();
        handle.stop().await;
        was_live
    }

    /// Stats of a session that ended by itself stay readable until it is
    /// reaped.
    pub fn reporter_stats(&self, worker_id: &str) -> Result<ReporterStats, AppError> {
        self.reporters
            .get(worker_id)
            .map(|handle| handle.stats())
            .ok_or_else(|| AppError::NotFound(format!("worker {worker_id} is not being tracked")))
    }

    pub async fn worker_location(&self, worker_id: &str) -> Result<WorkerLocation, AppError> {
        self.locations
            .get(worker_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no location for worker {worker_id}")))
    }

    /// Starts following the assigned worker for `order_id`. Starting again
    /// while a tracker is live returns its current view.
    pub async fn start_route_tracking(&self, order_id: &str) -> Result<RouteView, AppError> {
        if let Some(handle) = self.route_trackers.get(order_id) {
            if !handle.is_finished() {
                return Ok(handle.view());
            }
        }

        let order = self.ledger.get(order_id).await?;
        let Some(worker_id) = order.worker_id.clone() else {
            return Err(AppError::Conflict(format!(
                "order {order_id} has no assigned worker yet"
            )));
        };
        if order.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "order {order_id} is already {:?}",
                order.status
            )));
        }

        self.reap_finished();
        self.stop_route_tracking(order_id).await;

        let handle = RouteTracker::spawn(
            order_id.to_string(),
            RouteCache::new(order.origin, worker_id.clone(), self.settings.route),
            self.routes.clone(),
            self.locations.watch(&worker_id),
            self.ledger.watch(order_id),
            self.metrics.clone(),
        );
        let view = handle.view();
        self.route_trackers.insert(order_id.to_string(), handle);

        self.audit.record(
            AuditEntry::new("route_tracking_start", AuditOutcome::Ok)
                .order(order_id)
                .worker(&worker_id),
        );
        info!(order_id = %order_id, worker_id = %worker_id, "route tracking requested");
        Ok(view)
    }

    pub fn route_view(&self, order_id: &str) -> Result<RouteView, AppError> {
        self.route_trackers
            .remove_if(order_id, |_, handle| handle.is_finished());
        self.route_trackers
            .get(order_id)
            .map(|handle| handle.view())
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} has no route tracking")))
    }

    pub async fn stop_route_tracking(&self, order_id: &str) -> bool {
        let Some((_, mut handle)) = self.route_trackers.remove(order_id) else {
            return false;
        };
        if handle.is_finished() {
            return false;
        }
        handle.stop().await;
        self.audit.record(
            AuditEntry::new("route_tracking_stop", AuditOutcome::Ok).order(order_id),
        );
        true
    }

    pub fn watch_order(&self, order_id: &str) -> watch::Receiver<Option<Order>> {
        self.ledger.watch(order_id)
    }

    pub fn watch_location(&self, worker_id: &str) -> watch::Receiver<Option<WorkerLocation>> {
        self.locations.watch(worker_id)
    }

    /// `None` once the order's route tracker is gone, including one that
    /// ended because the order finished.
    pub fn watch_route(&self, order_id: &str) -> Option<watch::Receiver<RouteView>> {
        self.route_trackers
            .remove_if(order_id, |_, handle| handle.is_finished());
        self.route_trackers
            .get(order_id)
            .map(|handle| handle.subscribe())
    }

    pub fn active_location_sessions(&self) -> usize {
        self.reporters
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub fn active_route_sessions(&self) -> usize {
        self.route_trackers
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Drops the handles of sessions that ended by themselves. Returns how
    /// many were removed.
    pub fn reap_finished(&self) -> usize {
        let before = self.reporters.len() + self.route_trackers.len();
        self.reporters.retain(|_, handle| !handle.is_finished());
        self.route_trackers.retain(|_, handle| !handle.is_finished());
        let reaped = before.saturating_sub(self.reporters.len() + self.route_trackers.len());
        if reaped > 0 {
            debug!(reaped, "finished tracking sessions reaped");
        }
        reaped
    }

    /// Reaps finished sessions every `every` until the task is dropped.
    pub async fn run_reaper(&self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            self.reap_finished();
        }
    }

    /// Stops every session; used on shutdown so workers are marked offline.
    pub async fn shutdown(&self) {
        let workers: Vec<String> = self.reporters.iter().map(|e| e.key().clone()).collect();
        for worker_id in workers {
            self.stop_location_tracking(&worker_id).await;
        }

        let orders: Vec<String> = self
            .route_trackers
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for order_id in orders {
            self.stop_route_tracking(&order_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::{Dispatcher, TrackingSettings};
    use crate::audit::audit_channel;
    use crate::engine::ledger::{NewOrder, OrderLedger};
    use crate::error::AppError;
    use crate::geo::{offset_north, GeoPoint};
    use crate::models::location::{OnlineStatus, PositionSample, WorkerLocation};
    use crate::models::order::{Order, OrderStatus};
    use crate::observability::metrics::Metrics;
    use crate::routing::{RouteError, RouteProvider, RouteResult};
    use crate::store::MemoryStore;

    const ORIGIN: GeoPoint = GeoPoint {
        lat: -6.2088,
        lng: 106.8456,
    };

    struct StraightLine;

    #[async_trait]
    impl RouteProvider for StraightLine {
        async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteResult, RouteError> {
            Ok(RouteResult {
                polyline: vec![origin, destination],
                distance_meters: crate::geo::haversine_meters(&origin, &destination),
                duration_seconds: 60.0,
            })
        }
    }

    fn dispatcher() -> Dispatcher {
        let metrics = Metrics::new();
        let (sink, _log, _rx) = audit_channel(256, 256);
        let orders: Arc<MemoryStore<Order>> = Arc::new(MemoryStore::new(64));
        let locations: Arc<MemoryStore<WorkerLocation>> = Arc::new(MemoryStore::new(64));
        let ledger = OrderLedger::new(orders, sink.clone(), metrics.clone());
        Dispatcher::new(
            ledger,
            locations,
            Arc::new(StraightLine),
            sink,
            metrics,
            TrackingSettings::default(),
        )
    }

    async fn assigned_order(dispatcher: &Dispatcher, worker_id: &str) -> Order {
        let order = dispatcher
            .ledger()
            .create_order(NewOrder {
                customer_id: "customer-1".to_string(),
                service_category: "electrical".to_string(),
                description: "fuse box".to_string(),
                origin: ORIGIN,
            })
            .await
            .unwrap();
        assert!(dispatcher.claim(&order.id, worker_id).await.unwrap());
        dispatcher.ledger().get(&order.id).await.unwrap()
    }

    async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn only_the_assigned_worker_can_start_tracking() {
        let dispatcher = dispatcher();
        let order = assigned_order(&dispatcher, "worker-a").await;

        let err = dispatcher
            .start_location_tracking("worker-b", &order.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        dispatcher
            .start_location_tracking("worker-a", &order.id)
            .await
            .unwrap();
        assert_eq!(dispatcher.active_location_sessions(), 1);
    }

    #[tokio::test]
    async fn stop_location_tracking_is_idempotent() {
        let dispatcher = dispatcher();
        let order = assigned_order(&dispatcher, "worker-a").await;
        dispatcher
            .start_location_tracking("worker-a", &order.id)
            .await
            .unwrap();

        dispatcher
            .submit_sample(
                "worker-a",
                PositionSample {
                    lat: ORIGIN.lat + 0.01,
                    lng: ORIGIN.lng,
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();
        eventually("first write", || {
            dispatcher
                .reporter_stats("worker-a")
                .is_ok_and(|stats| stats.executed == 1)
        })
        .await;

        assert!(dispatcher.stop_location_tracking("worker-a").await);
        assert!(!dispatcher.stop_location_tracking("worker-a").await);

        let location = dispatcher.worker_location("worker-a").await.unwrap();
        assert_eq!(location.online_status, OnlineStatus::Offline);
        assert!(dispatcher.reporter_stats("worker-a").is_err());
    }

    #[tokio::test]
    async fn route_follows_reported_locations_end_to_end() {
        let dispatcher = dispatcher();
        let order = assigned_order(&dispatcher, "worker-a").await;

        dispatcher
            .start_location_tracking("worker-a", &order.id)
            .await
            .unwrap();
        let initial = dispatcher.start_route_tracking(&order.id).await.unwrap();
        assert!(initial.snapshot.is_none());

        let worker_at = offset_north(&ORIGIN, 2_000.0);
        dispatcher
            .submit_sample(
                "worker-a",
                PositionSample {
                    lat: worker_at.lat,
                    lng: worker_at.lng,
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();

        eventually("route snapshot", || {
            dispatcher
                .route_view(&order.id)
                .is_ok_and(|view| view.snapshot.is_some())
        })
        .await;

        let snapshot = dispatcher.route_view(&order.id).unwrap().snapshot.unwrap();
        assert_eq!(snapshot.dest_worker_id, "worker-a");
        assert_eq!(snapshot.origin, ORIGIN);
        assert!((snapshot.distance_meters - 2_000.0).abs() < 1.0);

        assert!(dispatcher.stop_route_tracking(&order.id).await);
        assert!(dispatcher.route_view(&order.id).is_err());
    }

    #[tokio::test]
    async fn finishing_the_order_ends_location_tracking() {
        let dispatcher = dispatcher();
        let order = assigned_order(&dispatcher, "worker-a").await;
        dispatcher
            .start_location_tracking("worker-a", &order.id)
            .await
            .unwrap();
        dispatcher
            .submit_sample(
                "worker-a",
                PositionSample {
                    lat: ORIGIN.lat,
                    lng: ORIGIN.lng + 0.01,
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();
        eventually("first write", || {
            dispatcher
                .reporter_stats("worker-a")
                .is_ok_and(|stats| stats.executed == 1)
        })
        .await;

        dispatcher
            .transition(&order.id, OrderStatus::Cancelled)
            .await
            .unwrap();

        eventually("reporter stop", || {
            dispatcher
                .reporter_stats("worker-a")
                .is_ok_and(|stats| stats.stopped_at.is_some())
        })
        .await;
        let location = dispatcher.worker_location("worker-a").await.unwrap();
        assert_eq!(location.online_status, OnlineStatus::Offline);
    }

    #[tokio::test]
    async fn sessions_ended_by_the_order_are_not_active_and_get_reaped() {
        let dispatcher = dispatcher();
        let order = assigned_order(&dispatcher, "worker-a").await;
        dispatcher
            .start_location_tracking("worker-a", &order.id)
            .await
            .unwrap();
        dispatcher.start_route_tracking(&order.id).await.unwrap();
        assert_eq!(dispatcher.active_location_sessions(), 1);
        assert_eq!(dispatcher.active_route_sessions(), 1);

        dispatcher
            .transition(&order.id, OrderStatus::Cancelled)
            .await
            .unwrap();

        eventually("sessions to end", || {
            dispatcher.active_location_sessions() == 0 && dispatcher.active_route_sessions() == 0
        })
        .await;

        // Reporter stats stay readable until reaped.
        assert!(dispatcher.reporter_stats("worker-a").is_ok());
        assert!(dispatcher.watch_route(&order.id).is_none());
        assert!(dispatcher.route_view(&order.id).is_err());

        assert_eq!(dispatcher.reap_finished(), 1);
        assert_eq!(dispatcher.reap_finished(), 0);
        assert!(dispatcher.reporter_stats("worker-a").is_err());
        assert!(!dispatcher.stop_location_tracking("worker-a").await);
        assert!(!dispatcher.stop_route_tracking(&order.id).await);
    }

    #[tokio::test]
    async fn stopping_a_session_that_already_ended_reports_not_tracking() {
        let dispatcher = dispatcher();
        let order = assigned_order(&dispatcher, "worker-a").await;
        dispatcher
            .start_location_tracking("worker-a", &order.id)
            .await
            .unwrap();
        dispatcher.start_route_tracking(&order.id).await.unwrap();

        dispatcher
            .transition(&order.id, OrderStatus::InProgress)
            .await
            .unwrap();
        dispatcher
            .transition(&order.id, OrderStatus::Done)
            .await
            .unwrap();
        eventually("sessions to end", || {
            dispatcher.active_location_sessions() == 0 && dispatcher.active_route_sessions() == 0
        })
        .await;

        assert!(!dispatcher.stop_location_tracking("worker-a").await);
        assert!(!dispatcher.stop_route_tracking(&order.id).await);
    }

    #[tokio::test]
    async fn route_tracking_needs_an_assigned_worker() {
        let dispatcher = dispatcher();
        let order = dispatcher
            .ledger()
            .create_order(NewOrder {
                customer_id: "customer-1".to_string(),
                service_category: "cleaning".to_string(),
                description: String::new(),
                origin: ORIGIN,
            })
            .await
            .unwrap();

        let err = dispatcher.start_route_tracking(&order.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
