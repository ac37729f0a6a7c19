//! # globaldb-core
//!
//! Replication core of globaldb: a key-value store whose replicas converge
//! by exchanging delta-CRDTs over a Merkle-DAG.
//!
//! Every local write becomes an immutable [`Delta`](globaldb_dag::Delta)
//! whose parents are the replica's current heads. Peers learn new heads
//! through gossip, fetch whatever history they are missing and merge it in
//! causal order. Conflicting writes to a key resolve by priority, then by
//! delta identifier, so every replica that has seen the same deltas reads
//! the same values.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use globaldb_core::{MemoryStateStore, Replica, ReplicaConfigBuilder};
//! use globaldb_dag::{MemoryDAGStore, MemoryNetwork};
//!
//! #[tokio::main]
//! async fn main() -> globaldb_core::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let replica = Replica::open(
//!         ReplicaConfigBuilder::new().replica_id("alice").build(),
//!         Arc::new(MemoryDAGStore::new()),
//!         Arc::new(MemoryStateStore::new()),
//!         Arc::new(network.join("alice", "globaldb")),
//!     );
//!
//!     replica.put("/fruit/apple", "red").await?;
//!     assert_eq!(replica.get("/fruit/apple")?, Some(b"red".to_vec()));
//!
//!     replica.delete("/fruit/apple").await?;
//!     assert!(!replica.has("/fruit/apple")?);
//!
//!     replica.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`resolve`] - conflict resolution order
//! - [`state`] - materialized key records and the state store contract
//! - [`merge`] - applying deltas
//! - [`clock`] - local priority assignment
//! - [`sync`] - fetching and ordering remote history
//! - [`announce`] - head announcements
//! - [`events`] - replica events and statistics
//! - [`config`] - replica configuration

pub mod announce;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod merge;
mod rebroadcast;
mod replica;
pub mod resolve;
pub mod state;
pub mod sync;

pub use announce::HeadAnnouncement;
pub use clock::PriorityClock;
pub use config::{ReplicaConfig, ReplicaConfigBuilder};
pub use error::{ReplicaError, Result};
pub use events::{ReplicaEvent, ReplicaStats};
pub use merge::{ApplyOutcome, KeyChange, MergeEngine};
pub use replica::Replica;
pub use resolve::Version;
pub use state::{KeyRecord, MaterializedStore, MemoryStateStore, StateError};
pub use sync::{causal_order, CausalState, LearnReport, MergedDelta, SyncProcessor};
