//! Content-addressed block storage for deltas.
//!
//! The replication core only needs `put`/`get` by content identifier; the
//! real block exchange (IPFS-style) is supplied by the embedding
//! application. [`MemoryDAGStore`] is the in-process implementation used by
//! tests and the simulation binary; several replicas sharing one instance
//! models a network where every published block is eventually fetchable.

use crate::delta::Delta;
use crate::error::{DagError, Result};
use crate::hash::Cid;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Trait for content-addressed DAG storage.
#[async_trait]
pub trait DAGStore: Send + Sync + 'static {
    /// Store a block, returning its identifier. Idempotent.
    async fn put(&self, bytes: Vec<u8>) -> Result<Cid>;

    /// Fetch a block by identifier.
    ///
    /// Returns [`DagError::NotFound`] while the block is not retrievable.
    async fn get(&self, cid: &Cid) -> Result<Vec<u8>>;

    /// Check whether a block is retrievable.
    async fn has(&self, cid: &Cid) -> Result<bool>;
}

/// Fetch and decode a delta, verifying its content hash.
pub async fn fetch_delta<S: DAGStore + ?Sized>(store: &S, cid: &Cid) -> Result<Delta> {
    let bytes = store.get(cid).await?;
    Delta::decode_verified(cid, &bytes)
}

/// In-memory implementation of [`DAGStore`].
#[derive(Debug, Default)]
pub struct MemoryDAGStore {
    /// All blocks indexed by CID.
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,

    /// Blocks that exist but are reported as not found.
    withheld: RwLock<HashSet<Cid>>,

    /// When set, every `put` fails.
    fail_puts: AtomicBool,

    /// Number of `get` calls served, including misses.
    gets: AtomicU64,
}

impl MemoryDAGStore {
    pub fn new() -> Self {
        MemoryDAGStore::default()
    }

    /// Make a block unretrievable until [`release`](Self::release) is called.
    pub fn withhold(&self, cid: Cid) {
        self.withheld.write().insert(cid);
    }

    /// Make a withheld block retrievable again.
    pub fn release(&self, cid: &Cid) {
        self.withheld.write().remove(cid);
    }

    /// Insert raw bytes under an arbitrary identifier, bypassing content
    /// addressing. Used to simulate corrupt or adversarial blocks.
    pub fn insert_raw(&self, cid: Cid, bytes: Vec<u8>) {
        self.blocks.write().insert(cid, bytes);
    }

    /// Toggle failure of subsequent `put` calls.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Number of `get` calls served so far.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Get the total number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DAGStore for MemoryDAGStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<Cid> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(DagError::Persistence("block store rejected write".into()));
        }
        let cid = Cid::of(&bytes);
        self.blocks.write().entry(cid).or_insert(bytes);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if self.withheld.read().contains(cid) {
            return Err(DagError::NotFound(*cid));
        }
        self.blocks
            .read()
            .get(cid)
            .cloned()
            .ok_or(DagError::NotFound(*cid))
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(!self.withheld.read().contains(cid) && self.blocks.read().contains_key(cid))
    }
}
