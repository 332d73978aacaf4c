use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use crate::models::audit::{AuditEntry, AuditOutcome};

/// Producer side of the audit trail. Recording never waits: when the writer
/// falls behind, entries are dropped with a warning.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEntry>,
}

impl AuditSink {
    pub fn record(&self, entry: AuditEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                warn!(operation = %entry.operation, "audit buffer full; dropping entry");
            }
            Err(TrySendError::Closed(entry)) => {
                warn!(operation = %entry.operation, "audit writer gone; dropping entry");
            }
        }
    }
}

/// The most recent entries, kept for inspection over the API.
#[derive(Clone)]
pub struct AuditLog {
    entries: Arc<Mutex<VecDeque<AuditEntry>>>,
    retain: usize,
}

impl AuditLog {
    fn new(retain: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(retain.min(1024)))),
            retain: retain.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, entry: AuditEntry) {
        let mut entries = self.lock();
        if entries.len() == self.retain {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<AuditEntry> {
        self.lock().iter().cloned().collect()
    }
}

pub fn audit_channel(
    buffer_size: usize,
    retain: usize,
) -> (AuditSink, AuditLog, mpsc::Receiver<AuditEntry>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (AuditSink { tx }, AuditLog::new(retain), rx)
}

pub async fn run_audit_writer(log: AuditLog, mut rx: mpsc::Receiver<AuditEntry>) {
    while let Some(entry) = rx.recv().await {
        match entry.outcome {
            AuditOutcome::Error => warn!(
                target: "audit",
                operation = %entry.operation,
                order_id = entry.order_id.as_deref().unwrap_or("-"),
                worker_id = entry.worker_id.as_deref().unwrap_or("-"),
                error = entry.error.as_deref().unwrap_or("-"),
                "operation failed"
            ),
            outcome => info!(
                target: "audit",
                operation = %entry.operation,
                order_id = entry.order_id.as_deref().unwrap_or("-"),
                worker_id = entry.worker_id.as_deref().unwrap_or("-"),
                outcome = ?outcome,
                "operation recorded"
            ),
        }
        log.push(entry);
    }
}
