//! Error types for the DAG layer.

use crate::hash::Cid;
use thiserror::Error;

/// Errors raised by delta decoding and DAG storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    /// The block is not (yet) retrievable from the store.
    #[error("Delta not found: {}", .0.short())]
    NotFound(Cid),

    /// The bytes do not decode to a well-formed delta.
    #[error("Malformed delta: {0}")]
    Malformed(String),

    /// The underlying block store failed.
    #[error("DAG store failure: {0}")]
    Persistence(String),
}

impl From<serde_json::Error> for DagError {
    fn from(err: serde_json::Error) -> Self {
        DagError::Malformed(err.to_string())
    }
}

/// Errors raised by a broadcaster transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Broadcaster closed")]
    Closed,

    #[error("Broadcast failed: {0}")]
    Send(String),
}

pub type Result<T> = std::result::Result<T, DagError>;
