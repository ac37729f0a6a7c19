//! Head announcements and the receive loop.

use crate::error::{ReplicaError, Result};
use crate::events::ReplicaEvent;
use crate::replica::Inner;
use futures::StreamExt;
use globaldb_dag::Cid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Gossip payload telling peers about heads of the sender's DAG.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadAnnouncement {
    /// Replica that sent the announcement, for logging only.
    #[serde(default)]
    pub origin: String,
    pub heads: Vec<Cid>,
}

impl HeadAnnouncement {
    pub fn new(origin: impl Into<String>, heads: Vec<Cid>) -> Self {
        HeadAnnouncement {
            origin: origin.into(),
            heads,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ReplicaError::Broadcast(format!("cannot encode announcement: {}", e)))
    }

    /// Decode a payload received from the broadcaster.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let announcement: HeadAnnouncement = serde_json::from_slice(bytes)
            .map_err(|e| ReplicaError::MalformedDelta(format!("bad announcement: {}", e)))?;
        if announcement.heads.is_empty() {
            return Err(ReplicaError::MalformedDelta(
                "announcement without heads".into(),
            ));
        }
        Ok(announcement)
    }
}

/// Consume the broadcaster until the replica is cancelled.
///
/// Every announced head not already being learned gets its own task, so one
/// slow ancestor chain never holds up unrelated heads.
pub(crate) async fn receive_loop(inner: Arc<Inner>) {
    let mut stream = inner.broadcaster.subscribe();
    let mut learners: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            payload = stream.next() => match payload {
                Some(payload) => dispatch(&inner, &payload, &mut learners),
                None => {
                    debug!(replica = %inner.config.replica_id, "broadcast stream ended, resubscribing");
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                    }
                    stream = inner.broadcaster.subscribe();
                }
            },
            Some(joined) = learners.join_next(), if !learners.is_empty() => {
                if let Err(err) = joined {
                    warn!(replica = %inner.config.replica_id, error = %err, "learn task failed");
                }
            }
        }
    }

    learners.shutdown().await;
    debug!(replica = %inner.config.replica_id, "receive loop stopped");
}

fn dispatch(inner: &Arc<Inner>, payload: &[u8], learners: &mut JoinSet<()>) {
    let announcement = match HeadAnnouncement::decode(payload) {
        Ok(announcement) => announcement,
        Err(err) => {
            inner.counters.malformed();
            warn!(replica = %inner.config.replica_id, error = %err, "dropping malformed message");
            inner.emit(ReplicaEvent::MalformedMessage {
                reason: err.to_string(),
            });
            return;
        }
    };

    trace!(
        replica = %inner.config.replica_id,
        origin = %announcement.origin,
        heads = announcement.heads.len(),
        "announcement received"
    );
    for head in announcement.heads {
        if !inner.begin_learn(head) {
            continue;
        }
        let inner = Arc::clone(inner);
        learners.spawn(async move {
            // Failures are reported through events and stats.
            let _ = inner.learn(head).await;
            inner.end_learn(&head);
        });
    }
}
