//! Periodic re-announcement of the head set.

use crate::replica::Inner;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{trace, warn};

/// Announce the full head set every `rebroadcast_interval` until cancelled.
pub(crate) async fn rebroadcast_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.rebroadcast_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let heads = inner.heads().await;
                if heads.is_empty() {
                    continue;
                }
                trace!(replica = %inner.config.replica_id, heads = heads.len(), "rebroadcasting heads");
                match inner.announce(heads).await {
                    Ok(()) => inner.counters.rebroadcast(),
                    Err(err) => warn!(replica = %inner.config.replica_id, error = %err, "rebroadcast failed"),
                }
            }
        }
    }
}
