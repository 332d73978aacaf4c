use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use super::{Document, DocumentStore, Mutation, StoreError, TxDecision, TxOutcome};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

struct Slot<D> {
    version: u64,
    doc: Option<D>,
    tx: watch::Sender<Option<D>>,
}

impl<D> Slot<D> {
    fn empty() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            version: 0,
            doc: None,
            tx,
        }
    }
}

/// In-process store with optimistic concurrency control.
///
/// A transaction reads the document and its version, runs the body without
/// holding any lock, then commits only if the version is still the one it
/// read. A lost race re-runs the body against the fresh state.
pub struct MemoryStore<D: Document> {
    docs: DashMap<String, Slot<D>>,
    changes_tx: broadcast::Sender<D>,
    max_attempts: u32,
}

impl<D: Document> MemoryStore<D> {
    pub fn new(event_buffer_size: usize) -> Self {
        let (changes_tx, _unused_rx) = broadcast::channel(event_buffer_size.max(1));
        Self {
            docs: DashMap::new(),
            changes_tx,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.docs.iter().filter(|slot| slot.doc.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self, id: &str) -> (Option<D>, u64) {
        match self.docs.get(id) {
            Some(slot) => (slot.doc.clone(), slot.version),
            None => (None, 0),
        }
    }

    /// Writes `doc` if the slot is still at `expected_version`. Notifications
    /// go out while the shard lock is held so subscribers see commit order.
    fn compare_and_commit(&self, id: &str, expected_version: u64, doc: &D) -> bool {
        let mut slot = self.docs.entry(id.to_string()).or_insert_with(Slot::empty);
        if slot.version != expected_version {
            return false;
        }

        slot.version += 1;
        slot.doc = Some(doc.clone());
        slot.tx.send_replace(Some(doc.clone()));
        let _ = self.changes_tx.send(doc.clone());
        true
    }
}

#[async_trait]
impl<D: Document> DocumentStore<D> for MemoryStore<D> {
    async fn get(&self, id: &str) -> Result<Option<D>, StoreError> {
        Ok(self.snapshot(id).0)
    }

    async fn list(&self) -> Result<Vec<D>, StoreError> {
        Ok(self
            .docs
            .iter()
            .filter_map(|slot| slot.doc.clone())
            .collect())
    }

    async fn insert(&self, doc: D) -> Result<D, StoreError> {
        let id = doc.doc_id().to_string();
        let (current, version) = self.snapshot(&id);
        if current.is_some() || !self.compare_and_commit(&id, version, &doc) {
            return Err(StoreError::AlreadyExists(id));
        }
        Ok(doc)
    }

    async fn read_modify_write(
        &self,
        id: &str,
        f: Mutation<'_, D>,
    ) -> Result<TxOutcome<D>, StoreError> {
        for attempt in 1..=self.max_attempts {
            let (current, version) = self.snapshot(id);

            let next = match f(current.as_ref()) {
                TxDecision::Commit(next) => next,
                TxDecision::Abort => return Ok(TxOutcome::Aborted(current)),
            };

            if next.doc_id() != id {
                return Err(StoreError::IdMismatch {
                    expected: id.to_string(),
                    actual: next.doc_id().to_string(),
                });
            }

            if self.compare_and_commit(id, version, &next) {
                return Ok(TxOutcome::Committed(next));
            }

            debug!(doc_id = %id, attempt, "transaction conflict; retrying");
            tokio::task::yield_now().await;
        }

        Err(StoreError::Contention {
            id: id.to_string(),
            attempts: self.max_attempts,
        })
    }

    fn watch(&self, id: &str) -> watch::Receiver<Option<D>> {
        self.docs
            .entry(id.to_string())
            .or_insert_with(Slot::empty)
            .tx
            .subscribe()
    }

    fn changes(&self) -> broadcast::Receiver<D> {
        self.changes_tx.subscribe()
    }
}
