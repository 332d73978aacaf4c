use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::audit::{AuditEntry, AuditOutcome};
use crate::models::order::{Order, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::store::{DocumentStore, StoreError, TxDecision, TxOutcome};

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer_id: String,
    pub service_category: String,
    pub description: String,
    pub origin: GeoPoint,
}

/// The only mutation path into order records. Every write goes through one
/// store transaction so checks and writes see the same state.
#[derive(Clone)]
pub struct OrderLedger {
    store: Arc<dyn DocumentStore<Order>>,
    audit: AuditSink,
    metrics: Metrics,
}

impl OrderLedger {
    pub fn new(store: Arc<dyn DocumentStore<Order>>, audit: AuditSink, metrics: Metrics) -> Self {
        Self {
            store,
            audit,
            metrics,
        }
    }

    pub async fn create_order(&self, request: NewOrder) -> Result<Order, AppError> {
        require_id("customer_id", &request.customer_id)?;
        if request.service_category.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "service_category cannot be empty".to_string(),
            ));
        }
        request.origin.validate()?;

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4().to_string(),
            customer_id: request.customer_id,
            worker_id: None,
            service_category: request.service_category,
            description: request.description,
            origin: request.origin,
            status: OrderStatus::Requested,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        };

        let order = self.store.insert(order).await.map_err(|err| {
            error!(error = %err, "failed to store new order");
            self.audit
                .record(AuditEntry::new("create_order", AuditOutcome::Error).error(&err));
            AppError::from(err)
        })?;

        info!(order_id = %order.id, customer_id = %order.customer_id, "order requested");
        Ok(order)
    }

    pub async fn get(&self, order_id: &str) -> Result<Order, AppError> {
        require_id("order_id", order_id)?;
        self.store
            .get(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    /// Orders sorted oldest first, optionally filtered by status.
    pub async fn list(&self, status: Option<OrderStatus>) -> Result<Vec<Order>, AppError> {
        let mut orders: Vec<Order> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|order| status.is_none_or(|status| order.status == status))
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    /// Orders still waiting for a worker.
    pub async fn open_orders(&self) -> Result<Vec<Order>, AppError> {
        self.list(Some(OrderStatus::Requested)).await
    }

    pub async fn orders_for_worker(&self, worker_id: &str) -> Result<Vec<Order>, AppError> {
        require_id("worker_id", worker_id)?;
        let orders = self.list(None).await?;
        Ok(orders
            .into_iter()
            .filter(|order| order.worker_id.as_deref() == Some(worker_id))
            .collect())
    }

    pub async fn orders_for_customer(&self, customer_id: &str) -> Result<Vec<Order>, AppError> {
        require_id("customer_id", customer_id)?;
        let orders = self.list(None).await?;
        Ok(orders
            .into_iter()
            .filter(|order| order.customer_id == customer_id)
            .collect())
    }

    /// Tries to take a Requested order for `worker_id`.
    ///
    /// `Ok(false)` means another worker got there first; it is an expected
    /// outcome, not an error. Among any number of concurrent callers for the
    /// same order exactly one sees `Ok(true)`.
    pub async fn claim(&self, order_id: &str, worker_id: &str) -> Result<bool, AppError> {
        if let Err(err) = require_id("order_id", order_id).and(require_id("worker_id", worker_id))
        {
            self.reject("claim", order_id, Some(worker_id), &err);
            self.metrics.claims_total.with_label_values(&["rejected"]).inc();
            return Err(err);
        }

        let now = Utc::now();
        let result = self
            .store
            .read_modify_write(order_id, &|current: Option<&Order>| {
                let Some(order) = current else {
                    return TxDecision::Abort;
                };
                let taken_by_other = order
                    .worker_id
                    .as_deref()
                    .is_some_and(|assigned| assigned != worker_id);
                if order.status != OrderStatus::Requested || taken_by_other {
                    return TxDecision::Abort;
                }

                let mut next = order.clone();
                next.worker_id = Some(worker_id.to_string());
                next.apply_status(OrderStatus::Assigned, now);
                TxDecision::Commit(next)
            })
            .await;

        match result {
            Ok(TxOutcome::Committed(order)) => {
                self.metrics.claims_total.with_label_values(&["won"]).inc();
                self.audit.record(
                    AuditEntry::new("claim", AuditOutcome::Ok)
                        .order(order_id)
                        .worker(worker_id),
                );
                info!(order_id = %order.id, worker_id = %worker_id, "order claimed");
                Ok(true)
            }
            Ok(TxOutcome::Aborted(Some(order))) => {
                self.metrics.claims_total.with_label_values(&["lost"]).inc();
                self.audit.record(
                    AuditEntry::new("claim", AuditOutcome::Rejected)
                        .order(order_id)
                        .worker(worker_id)
                        .error("order already taken"),
                );
                info!(
                    order_id = %order_id,
                    worker_id = %worker_id,
                    status = ?order.status,
                    "claim lost; order already taken"
                );
                Ok(false)
            }
            Ok(TxOutcome::Aborted(None)) => {
                let err = AppError::NotFound(format!("order {order_id} not found"));
                self.reject("claim", order_id, Some(worker_id), &err);
                self.metrics.claims_total.with_label_values(&["rejected"]).inc();
                Err(err)
            }
            Err(store_err) => {
                self.metrics.claims_total.with_label_values(&["error"]).inc();
                self.fail("claim", order_id, Some(worker_id), &store_err);
                Err(store_err.into())
            }
        }
    }

    /// Moves an order along the status table. The table check and the write
    /// happen inside one transaction.
    ///
    /// Assignment is reserved for [`OrderLedger::claim`], which also sets the
    /// worker: asking for Assigned on a Requested order is an invalid
    /// argument, and from any other status it is an invalid transition.
    pub async fn transition(&self, order_id: &str, next: OrderStatus) -> Result<Order, AppError> {
        if let Err(err) = require_id("order_id", order_id) {
            self.reject("transition", order_id, None, &err);
            return Err(err);
        }

        let now = Utc::now();
        let result = self
            .store
            .read_modify_write(order_id, &|current: Option<&Order>| match current {
                Some(order)
                    if next != OrderStatus::Assigned && order.status.can_transition_to(next) =>
                {
                    let mut updated = order.clone();
                    updated.apply_status(next, now);
                    TxDecision::Commit(updated)
                }
                _ => TxDecision::Abort,
            })
            .await;

        let err = match result {
            Ok(TxOutcome::Committed(order)) => {
                self.metrics.transitions_total.with_label_values(&["ok"]).inc();
                self.audit.record(
                    AuditEntry::new("transition", AuditOutcome::Ok).order(order_id),
                );
                info!(order_id = %order.id, status = ?order.status, "order status changed");
                return Ok(order);
            }
            Ok(TxOutcome::Aborted(Some(order)))
                if order.status == OrderStatus::Requested && next == OrderStatus::Assigned =>
            {
                AppError::InvalidArgument(
                    "orders are assigned by claiming them, not by transition".to_string(),
                )
            }
            Ok(TxOutcome::Aborted(Some(order))) => AppError::InvalidTransition {
                from: order.status,
                to: next,
            },
            Ok(TxOutcome::Aborted(None)) => AppError::NotFound(format!("order {order_id} not found")),
            Err(store_err) => {
                self.metrics
                    .transitions_total
                    .with_label_values(&["error"])
                    .inc();
                self.fail("transition", order_id, None, &store_err);
                return Err(store_err.into());
            }
        };

        self.metrics
            .transitions_total
            .with_label_values(&["rejected"])
            .inc();
        self.reject("transition", order_id, None, &err);
        Err(err)
    }

    pub fn watch(&self, order_id: &str) -> watch::Receiver<Option<Order>> {
        self.store.watch(order_id)
    }

    pub fn changes(&self) -> broadcast::Receiver<Order> {
        self.store.changes()
    }

    fn reject(&self, operation: &str, order_id: &str, worker_id: Option<&str>, err: &AppError) {
        let mut entry = AuditEntry::new(operation, AuditOutcome::Rejected)
            .order(order_id)
            .error(err);
        entry.worker_id = worker_id.map(str::to_string);
        self.audit.record(entry);
    }

    fn fail(&self, operation: &str, order_id: &str, worker_id: Option<&str>, err: &StoreError) {
        error!(
            operation,
            order_id = %order_id,
            worker_id = worker_id.unwrap_or("-"),
            error = %err,
            "ledger operation failed"
        );
        let mut entry = AuditEntry::new(operation, AuditOutcome::Error)
            .order(order_id)
            .error(err);
        entry.worker_id = worker_id.map(str::to_string);
        self.audit.record(entry);
    }
}

fn require_id(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidArgument(format!("{field} cannot be blank")));
    }
    Ok(())
}
