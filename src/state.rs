use std::sync::Arc;

use tokio::sync::mpsc;

use crate::audit::{audit_channel, AuditLog};
use crate::config::Config;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::ledger::OrderLedger;
use crate::models::audit::AuditEntry;
use crate::models::location::WorkerLocation;
use crate::models::order::Order;
use crate::observability::metrics::Metrics;
use crate::routing::RouteProvider;
use crate::store::MemoryStore;

pub struct AppState {
    pub orders: Arc<MemoryStore<Order>>,
    pub locations: Arc<MemoryStore<WorkerLocation>>,
    pub dispatcher: Dispatcher,
    pub audit_log: AuditLog,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        config: &Config,
        routes: Arc<dyn RouteProvider>,
    ) -> (Self, mpsc::Receiver<AuditEntry>) {
        let metrics = Metrics::new();
        let (audit, audit_log, audit_rx) =
            audit_channel(config.audit_buffer_size, config.audit_retain);

        let orders: Arc<MemoryStore<Order>> = Arc::new(
            MemoryStore::new(config.event_buffer_size).with_max_attempts(config.store_max_attempts),
        );
        let locations: Arc<MemoryStore<WorkerLocation>> = Arc::new(
            MemoryStore::new(config.event_buffer_size).with_max_attempts(config.store_max_attempts),
        );

        let ledger = OrderLedger::new(orders.clone(), audit.clone(), metrics.clone());
        let dispatcher = Dispatcher::new(
            ledger,
            locations.clone(),
            routes,
            audit,
            metrics.clone(),
            config.tracking_settings(),
        );

        (
            Self {
                orders,
                locations,
                dispatcher,
                audit_log,
                metrics,
            },
            audit_rx,
        )
    }
}
