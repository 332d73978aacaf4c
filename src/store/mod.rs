//! Document store abstraction.
//!
//! The ledger and the trackers only ever talk to a store through
//! [`DocumentStore`], so the concrete backend can be swapped without touching
//! their logic. [`memory::MemoryStore`] is the in-process backend used by the
//! service binary and the tests.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

pub use memory::MemoryStore;

pub trait Document: Clone + Send + Sync + 'static {
    fn doc_id(&self) -> &str;
}

/// Returned by a transaction body to say what should happen to the document.
#[derive(Debug, Clone, PartialEq)]
pub enum TxDecision<D> {
    Commit(D),
    Abort,
}

/// Result of a committed or aborted transaction. `Aborted` carries the state
/// the body saw on its final attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome<D> {
    Committed(D),
    Aborted(Option<D>),
}

/// Transaction body. It may run more than once when the store detects a
/// concurrent commit, so it must be free of side effects.
pub type Mutation<'a, D> = &'a (dyn Fn(Option<&D>) -> TxDecision<D> + Send + Sync);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("document {0} already exists")]
    AlreadyExists(String),

    #[error("transaction on {id} gave up after {attempts} conflicting attempts")]
    Contention { id: String, attempts: u32 },

    #[error("transaction on {expected} tried to write document {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DocumentStore<D: Document>: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<D>, StoreError>;

    async fn list(&self) -> Result<Vec<D>, StoreError>;

    async fn insert(&self, doc: D) -> Result<D, StoreError>;

    /// Runs `f` against the current state of `id` and commits its decision
    /// atomically. No other commit to `id` can land between the read `f` saw
    /// and the write.
    async fn read_modify_write(
        &self,
        id: &str,
        f: Mutation<'_, D>,
    ) -> Result<TxOutcome<D>, StoreError>;

    /// Latest state of one document, updated after every commit.
    fn watch(&self, id: &str) -> watch::Receiver<Option<D>>;

    /// Every committed document, in commit order.
    fn changes(&self) -> broadcast::Receiver<D>;
}
