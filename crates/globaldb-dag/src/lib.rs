//! # globaldb-dag
//!
//! Content-addressed causal history for globaldb.
//!
//! This crate provides:
//! - [`Cid`]: SHA-256 content identifiers
//! - [`Delta`]: the immutable unit of change and its canonical encoding
//! - [`DAGStore`]: content-addressed block storage, with [`MemoryDAGStore`]
//! - [`HeadSet`]: the local causal frontier
//! - [`Broadcaster`]: the gossip contract, with [`MemoryNetwork`]
//!
//! ## Example
//!
//! ```rust
//! use globaldb_dag::{DeltaBuilder, HeadSet};
//!
//! let root = DeltaBuilder::new().with_priority(1).put("/fruit", "apple").build();
//! let root_cid = root.cid().unwrap();
//!
//! let child = DeltaBuilder::new()
//!     .with_parent(root_cid)
//!     .with_priority(2)
//!     .remove("/fruit", vec![root_cid])
//!     .build();
//! let child_cid = child.cid().unwrap();
//!
//! let mut heads = HeadSet::new();
//! heads.advance(root_cid, &root.parents);
//! heads.advance(child_cid, &child.parents);
//! assert_eq!(heads.to_vec(), vec![child_cid]);
//! ```

mod broadcaster;
mod delta;
mod error;
mod hash;
mod heads;
mod store;

pub use broadcaster::{Broadcaster, MemoryBroadcaster, MemoryNetwork, NetworkConfig, PayloadStream};
pub use delta::{Delta, DeltaBuilder};
pub use error::{BroadcastError, DagError};
pub use hash::{Cid, Hasher};
pub use heads::HeadSet;
pub use store::{fetch_delta, DAGStore, MemoryDAGStore};
