//! Gossip contract for head dissemination.
//!
//! The [`Broadcaster`] carries opaque payloads over a named topic with no
//! ordering or delivery guarantee. Replicas use it to announce their heads;
//! receivers pull the missing history from the DAG store.
//!
//! [`MemoryNetwork`] is an in-process pub/sub hub for tests and simulation.
//! Peers can be split into partition groups; messages only flow between
//! peers in the same group.

use crate::error::BroadcastError;
use async_stream::stream;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Lazy, unbounded sequence of payloads received from peers.
pub type PayloadStream = BoxStream<'static, Vec<u8>>;

/// Publish/subscribe transport over a single topic.
#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    /// Best-effort publish to every reachable peer.
    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), BroadcastError>;

    /// Start a fresh subscription. May be called again to restart after the
    /// previous stream ended.
    fn subscribe(&self) -> PayloadStream;
}

/// Configuration for an in-memory network.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Messages buffered per subscriber before the slowest one starts
    /// losing them.
    pub capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig { capacity: 1024 }
    }
}

#[derive(Clone, Debug)]
struct Envelope {
    origin: String,
    payload: Vec<u8>,
}

/// In-process pub/sub hub shared by every [`MemoryBroadcaster`].
#[derive(Debug)]
pub struct MemoryNetwork {
    config: NetworkConfig,
    topics: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
    /// Partition group per peer; peers absent from the map are in group 0.
    groups: RwLock<HashMap<String, u32>>,
    next_group: AtomicU32,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_config(NetworkConfig::default())
    }

    pub fn with_config(config: NetworkConfig) -> Arc<Self> {
        Arc::new(MemoryNetwork {
            config,
            topics: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            next_group: AtomicU32::new(1),
        })
    }

    /// Join `topic` as `peer`.
    pub fn join(self: &Arc<Self>, peer: impl Into<String>, topic: &str) -> MemoryBroadcaster {
        let sender = self
            .topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.config.capacity).0)
            .clone();

        MemoryBroadcaster {
            peer: peer.into(),
            network: Arc::clone(self),
            sender,
            sent: AtomicU64::new(0),
        }
    }

    /// Put `peer` in partition group `group`.
    pub fn set_group(&self, peer: &str, group: u32) {
        self.groups.write().insert(peer.to_string(), group);
    }

    /// Cut `peer` off from everybody else.
    pub fn isolate(&self, peer: &str) {
        let group = self.next_group.fetch_add(1, Ordering::Relaxed);
        self.set_group(peer, group);
    }

    /// Remove every partition.
    pub fn heal(&self) {
        self.groups.write().clear();
    }

    fn group_of(&self, peer: &str) -> u32 {
        self.groups.read().get(peer).copied().unwrap_or(0)
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        self.group_of(from) == self.group_of(to)
    }
}

/// One peer's handle on a [`MemoryNetwork`] topic.
pub struct MemoryBroadcaster {
    peer: String,
    network: Arc<MemoryNetwork>,
    sender: broadcast::Sender<Envelope>,
    sent: AtomicU64,
}

impl MemoryBroadcaster {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Number of payloads published by this peer.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broadcaster for MemoryBroadcaster {
    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), BroadcastError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        // No subscriber is not an error: gossip is best-effort.
        let _ = self.sender.send(Envelope {
            origin: self.peer.clone(),
            payload,
        });
        Ok(())
    }

    fn subscribe(&self) -> PayloadStream {
        let mut rx = self.sender.subscribe();
        let peer = self.peer.clone();
        let network = Arc::clone(&self.network);

        stream! {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.origin != peer && network.reachable(&envelope.origin, &peer) {
                            yield envelope.payload;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(peer = %peer, skipped, "subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        .boxed()
    }
}
