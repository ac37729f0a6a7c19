//! Error types for the replication core.

use crate::state::StateError;
use globaldb_dag::{BroadcastError, Cid, DagError};
use thiserror::Error;

/// Errors that can occur in replica operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("Delta not found: {}", .0.short())]
    NotFound(Cid),

    #[error("Causal gap: delta {} applied before parent {}", .delta.short(), .missing.short())]
    CausalGap { delta: Cid, missing: Cid },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Malformed delta: {0}")]
    MalformedDelta(String),

    #[error("Traversal from head {} exceeded {limit} deltas", .head.short())]
    TraversalLimit { head: Cid, limit: usize },

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Replica closed")]
    Closed,
}

impl ReplicaError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicaError::NotFound(_))
    }
}

impl From<DagError> for ReplicaError {
    fn from(err: DagError) -> Self {
        match err {
            DagError::NotFound(cid) => ReplicaError::NotFound(cid),
            DagError::Malformed(reason) => ReplicaError::MalformedDelta(reason),
            DagError::Persistence(reason) => ReplicaError::Persistence(reason),
        }
    }
}

impl From<StateError> for ReplicaError {
    fn from(err: StateError) -> Self {
        ReplicaError::Persistence(err.to_string())
    }
}

impl From<BroadcastError> for ReplicaError {
    fn from(err: BroadcastError) -> Self {
        ReplicaError::Broadcast(err.to_string())
    }
}

/// Result type for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;
