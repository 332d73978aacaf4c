use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::AuditSink;
use crate::error::AppError;
use crate::geo::haversine_meters;
use crate::models::audit::{AuditEntry, AuditOutcome};
use crate::models::location::{OnlineStatus, PositionSample, WorkerLocation};
use crate::models::order::Order;
use crate::observability::metrics::Metrics;
use crate::store::{DocumentStore, StoreError, TxDecision, TxOutcome};

#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub min_distance_m: f64,
    pub min_interval: Duration,
    /// Cadence the device's location service is asked to deliver at.
    pub sample_interval: Duration,
    /// How far past `sample_interval` a delivery may lag before it is
    /// reported as late.
    pub max_delivery_delay: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_distance_m: 15.0,
            min_interval: Duration::from_secs(12),
            sample_interval: Duration::from_secs(12),
            max_delivery_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Moved too little, too soon.
    Throttled,
    /// Older than the last accepted sample.
    OutOfOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Write,
    Skip(SkipReason),
}

/// Decides which position samples are worth a store write.
///
/// A sample is dropped only when it is both close to and recent relative to
/// the last accepted one: at most `min_distance_m` away and less than
/// `min_interval` later. Moving far enough, or waiting long enough, is each
/// sufficient on its own to write.
#[derive(Debug, Clone)]
pub struct ThrottleGate {
    config: ThrottleConfig,
    last_accepted: Option<PositionSample>,
}

impl ThrottleGate {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            last_accepted: None,
        }
    }

    pub fn should_write(config: &ThrottleConfig, distance_m: Option<f64>, elapsed: Duration) -> bool {
        match distance_m {
            None => true,
            Some(distance_m) => {
                distance_m > config.min_distance_m || elapsed >= config.min_interval
            }
        }
    }

    pub fn evaluate(&self, sample: &PositionSample) -> GateDecision {
        let Some(last) = &self.last_accepted else {
            return GateDecision::Write;
        };

        let Ok(elapsed) = (sample.timestamp - last.timestamp).to_std() else {
            return GateDecision::Skip(SkipReason::OutOfOrder);
        };
        let distance_m = haversine_meters(&last.point(), &sample.point());

        if Self::should_write(&self.config, Some(distance_m), elapsed) {
            GateDecision::Write
        } else {
            GateDecision::Skip(SkipReason::Throttled)
        }
    }

    /// Records a sample that made it into the store.
    pub fn accept(&mut self, sample: PositionSample) {
        self.last_accepted = Some(sample);
    }

    pub fn last_accepted(&self) -> Option<&PositionSample> {
        self.last_accepted.as_ref()
    }
}

/// Observability counters for one reporter. `attempted` always equals
/// `executed + skipped + failed`.
#[derive(Debug)]
pub struct ReporterCounters {
    attempted: AtomicU64,
    executed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    started_at: DateTime<Utc>,
    stopped_at_ms: AtomicI64,
}

impl ReporterCounters {
    fn new() -> Self {
        Self {
            attempted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Utc::now(),
            stopped_at_ms: AtomicI64::new(0),
        }
    }

    fn mark_stopped(&self) {
        self.stopped_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReporterStats {
    pub worker_id: String,
    pub order_id: String,
    pub attempted: u64,
    pub executed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

pub struct ReporterHandle {
    worker_id: String,
    order_id: String,
    samples_tx: mpsc::Sender<PositionSample>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    counters: Arc<ReporterCounters>,
}

impl ReporterHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn samples(&self) -> mpsc::Sender<PositionSample> {
        self.samples_tx.clone()
    }

    pub async fn submit(&self, sample: PositionSample) -> Result<(), AppError> {
        submit_sample(&self.samples_tx, sample).await
    }

    pub fn stats(&self) -> ReporterStats {
        let counters = &self.counters;
        let stopped_at_ms = counters.stopped_at_ms.load(Ordering::SeqCst);
        ReporterStats {
            worker_id: self.worker_id.clone(),
            order_id: self.order_id.clone(),
            attempted: counters.attempted.load(Ordering::SeqCst),
            executed: counters.executed.load(Ordering::SeqCst),
            skipped: counters.skipped.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
            started_at: counters.started_at,
            stopped_at: (stopped_at_ms != 0)
                .then(|| DateTime::from_timestamp_millis(stopped_at_ms))
                .flatten(),
        }
    }

    /// True once the sampling loop has exited, whether stopped explicitly or
    /// because the order finished.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Stops sampling and waits for the final offline write. Returns false
    /// when this handle had already been stopped.
    pub async fn stop(&mut self) -> bool {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        let Some(task) = self.task.take() else {
            return false;
        };
        if let Err(err) = task.await {
            warn!(worker_id = %self.worker_id, error = %err, "location reporter task failed");
        }
        true
    }
}

pub async fn submit_sample(
    samples_tx: &mpsc::Sender<PositionSample>,
    sample: PositionSample,
) -> Result<(), AppError> {
    sample.point().validate()?;
    samples_tx
        .send(sample)
        .await
        .map_err(|_| AppError::Conflict("location tracking already stopped".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    OrderFinished,
    SamplesClosed,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            StopReason::Requested => "requested",
            StopReason::OrderFinished => "order_finished",
            StopReason::SamplesClosed => "samples_closed",
        }
    }
}

/// Per-worker sampling loop. It is the only writer of its worker's location
/// document.
pub struct LocationReporter {
    worker_id: String,
    order_id: String,
    store: Arc<dyn DocumentStore<WorkerLocation>>,
    gate: ThrottleGate,
    counters: Arc<ReporterCounters>,
    metrics: Metrics,
    audit: AuditSink,
}

impl LocationReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        worker_id: String,
        order_id: String,
        store: Arc<dyn DocumentStore<WorkerLocation>>,
        order_rx: Option<watch::Receiver<Option<Order>>>,
        config: ThrottleConfig,
        channel_size: usize,
        metrics: Metrics,
        audit: AuditSink,
    ) -> ReporterHandle {
        let (samples_tx, samples_rx) = mpsc::channel(channel_size.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let counters = Arc::new(ReporterCounters::new());

        let reporter = LocationReporter {
            worker_id: worker_id.clone(),
            order_id: order_id.clone(),
            store,
            gate: ThrottleGate::new(config),
            counters: counters.clone(),
            metrics,
            audit,
        };
        let task = tokio::spawn(reporter.run(samples_rx, stop_rx, order_rx));

        ReporterHandle {
            worker_id,
            order_id,
            samples_tx,
            stop_tx: Some(stop_tx),
            task: Some(task),
            counters,
        }
    }

    async fn run(
        mut self,
        mut samples_rx: mpsc::Receiver<PositionSample>,
        mut stop_rx: oneshot::Receiver<()>,
        mut order_rx: Option<watch::Receiver<Option<Order>>>,
    ) {
        self.metrics.active_location_trackers.inc();
        self.audit.record(
            AuditEntry::new("tracking_start", AuditOutcome::Ok)
                .order(&self.order_id)
                .worker(&self.worker_id),
        );
        info!(worker_id = %self.worker_id, order_id = %self.order_id, "location tracking started");

        // A dropped handle closes `stop_rx`, which stops the loop the same
        // way an explicit stop does.
        let reason = loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break StopReason::Requested,
                _ = order_finished(&mut order_rx) => break StopReason::OrderFinished,
                sample = samples_rx.recv() => {
                    let Some(sample) = sample else {
                        break StopReason::SamplesClosed;
                    };
                    tokio::select! {
                        biased;
                        _ = &mut stop_rx => break StopReason::Requested,
                        _ = self.handle_sample(sample) => {}
                    }
                }
            }
        };

        self.mark_offline().await;
        self.counters.mark_stopped();
        self.metrics.active_location_trackers.dec();
        self.audit.record(
            AuditEntry::new("tracking_stop", AuditOutcome::Ok)
                .order(&self.order_id)
                .worker(&self.worker_id),
        );
        info!(
            worker_id = %self.worker_id,
            order_id = %self.order_id,
            reason = reason.as_str(),
            "location tracking stopped"
        );
    }

    async fn handle_sample(&mut self, sample: PositionSample) {
        self.counters.attempted.fetch_add(1, Ordering::SeqCst);
        self.warn_if_late(&sample);

        match self.gate.evaluate(&sample) {
            GateDecision::Skip(reason) => {
                self.counters.skipped.fetch_add(1, Ordering::SeqCst);
                self.metrics
                    .location_writes_total
                    .with_label_values(&["skipped"])
                    .inc();
                debug!(worker_id = %self.worker_id, reason = ?reason, "location sample skipped");
            }
            GateDecision::Write => match self.write_location(&sample).await {
                Ok(true) => {
                    self.gate.accept(sample);
                    self.counters.executed.fetch_add(1, Ordering::SeqCst);
                    self.metrics
                        .location_writes_total
                        .with_label_values(&["executed"])
                        .inc();
                }
                Ok(false) => {
                    self.counters.skipped.fetch_add(1, Ordering::SeqCst);
                    self.metrics
                        .location_writes_total
                        .with_label_values(&["skipped"])
                        .inc();
                    debug!(worker_id = %self.worker_id, "stored location is newer; sample skipped");
                }
                Err(err) => {
                    // The next sample is evaluated against the last persisted
                    // one, so it will most likely retry this write.
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    self.metrics
                        .location_writes_total
                        .with_label_values(&["failed"])
                        .inc();
                    warn!(worker_id = %self.worker_id, error = %err, "location write failed");
                }
            },
        }
    }

    fn warn_if_late(&self, sample: &PositionSample) {
        let budget = self.gate.config.sample_interval + self.gate.config.max_delivery_delay;
        if let Ok(age) = (Utc::now() - sample.timestamp).to_std() {
            if age > budget {
                warn!(
                    worker_id = %self.worker_id,
                    age_ms = age.as_millis() as u64,
                    "location sample delivered late"
                );
            }
        }
    }

    /// Returns `Ok(false)` when the stored location is already newer.
    async fn write_location(&self, sample: &PositionSample) -> Result<bool, StoreError> {
        let worker_id = self.worker_id.as_str();
        let outcome = self
            .store
            .read_modify_write(worker_id, &|current: Option<&WorkerLocation>| {
                if current.is_some_and(|current| current.updated_at > sample.timestamp) {
                    return TxDecision::Abort;
                }
                TxDecision::Commit(WorkerLocation {
                    worker_id: worker_id.to_string(),
                    latitude: sample.lat,
                    longitude: sample.lng,
                    online_status: OnlineStatus::Online,
                    updated_at: sample.timestamp,
                })
            })
            .await?;

        Ok(matches!(outcome, TxOutcome::Committed(_)))
    }

    async fn mark_offline(&self) {
        let worker_id = self.worker_id.as_str();
        let now = Utc::now();
        let outcome = self
            .store
            .read_modify_write(worker_id, &|current: Option<&WorkerLocation>| {
                let Some(current) = current else {
                    return TxDecision::Abort;
                };
                let mut next = current.clone();
                next.online_status = OnlineStatus::Offline;
                next.updated_at = now.max(current.updated_at);
                TxDecision::Commit(next)
            })
            .await;

        match outcome {
            Ok(TxOutcome::Committed(_)) => {
                debug!(worker_id = %self.worker_id, "worker marked offline");
            }
            Ok(TxOutcome::Aborted(_)) => {
                debug!(worker_id = %self.worker_id, "no stored location to mark offline");
            }
            Err(err) => {
                warn!(worker_id = %self.worker_id, error = %err, "failed to mark worker offline");
                self.audit.record(
                    AuditEntry::new("mark_offline", AuditOutcome::Error)
                        .order(&self.order_id)
                        .worker(&self.worker_id)
                        .error(&err),
                );
            }
        }
    }
}

/// Resolves once the watched order reaches a terminal status. Never resolves
/// without a watch.
async fn order_finished(order_rx: &mut Option<watch::Receiver<Option<Order>>>) {
    let Some(rx) = order_rx else {
        return std::future::pending().await;
    };

    loop {
        let finished = rx
            .borrow_and_update()
            .as_ref()
            .is_some_and(|order| order.status.is_terminal());
        if finished {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
