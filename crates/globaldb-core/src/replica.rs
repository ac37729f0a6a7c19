//! The replica: local writes, reads and the background replication tasks.

use crate::announce::{receive_loop, HeadAnnouncement};
use crate::clock::PriorityClock;
use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, Result};
use crate::events::{Counters, ReplicaEvent, ReplicaStats};
use crate::merge::{self, ApplyOutcome, MergeEngine};
use crate::rebroadcast::rebroadcast_loop;
use crate::state::MaterializedStore;
use crate::sync::{CausalState, LearnReport, SyncProcessor};
use globaldb_dag::{Broadcaster, Cid, DAGStore, DeltaBuilder};
use indexmap::IndexSet;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared between the replica handle and its tasks.
pub(crate) struct Inner {
    pub config: ReplicaConfig,
    pub dag: Arc<dyn DAGStore>,
    pub state: Arc<dyn MaterializedStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub clock: Arc<PriorityClock>,
    pub causal: Mutex<CausalState>,
    pub sync: SyncProcessor,
    pub events: broadcast::Sender<ReplicaEvent>,
    pub counters: Counters,
    pub cancel: CancellationToken,
    pending: parking_lot::Mutex<IndexSet<Cid>>,
    in_flight: parking_lot::Mutex<HashSet<Cid>>,
}

impl Inner {
    pub fn emit(&self, event: ReplicaEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn heads(&self) -> Vec<Cid> {
        self.causal.lock().await.heads.to_vec()
    }

    pub async fn announce(&self, heads: Vec<Cid>) -> Result<()> {
        let payload = HeadAnnouncement::new(self.config.replica_id.clone(), heads).encode()?;
        self.broadcaster.broadcast(payload).await?;
        self.counters.announced();
        Ok(())
    }

    /// Mark `head` as being learned; false if a learn is already running.
    pub fn begin_learn(&self, head: Cid) -> bool {
        self.in_flight.lock().insert(head)
    }

    pub fn end_learn(&self, head: &Cid) {
        self.in_flight.lock().remove(head);
    }

    /// Learn a remote head and report the outcome.
    pub async fn learn(&self, head: Cid) -> Result<LearnReport> {
        match self.sync.learn(head, &self.causal).await {
            Ok(report) => {
                self.settle_pending().await;
                if !report.merged.is_empty() {
                    self.counters.merged(report.merged.len());
                    for merged in &report.merged {
                        for change in &merged.changes {
                            self.emit(change.clone().into());
                        }
                    }
                    self.emit(ReplicaEvent::HeadMerged { head });
                    info!(
                        replica = %self.config.replica_id,
                        head = %head.short(),
                        deltas = report.merged.len(),
                        "merged remote head"
                    );
                }
                Ok(report)
            }
            Err(ReplicaError::Cancelled) => Err(ReplicaError::Cancelled),
            Err(err) => {
                self.mark_pending(head);
                self.counters.sync_failed();
                warn!(
                    replica = %self.config.replica_id,
                    head = %head.short(),
                    error = %err,
                    "failed to merge head"
                );
                self.emit(ReplicaEvent::SyncFailed {
                    head,
                    error: err.clone(),
                });
                Err(err)
            }
        }
    }

    /// Record `head` as the newest unmerged head, evicting the oldest past
    /// `max_pending_heads`.
    fn mark_pending(&self, head: Cid) {
        let mut pending = self.pending.lock();
        pending.shift_remove(&head);
        pending.insert(head);
        if pending.len() > self.config.max_pending_heads {
            if let Some(evicted) = pending.shift_remove_index(0) {
                self.counters.evicted();
                debug!(
                    replica = %self.config.replica_id,
                    head = %evicted.short(),
                    "evicted pending head"
                );
            }
        }
    }

    /// Forget pending heads that are applied by now, including ones merged
    /// as ancestors of another head.
    async fn settle_pending(&self) {
        if self.pending.lock().is_empty() {
            return;
        }
        let causal = self.causal.lock().await;
        self.pending
            .lock()
            .retain(|cid| !causal.engine.is_applied(cid));
    }

    /// Build a local delta on top of the current heads, persist it, apply it.
    ///
    /// `build` sees the causal state under the lock and returns `None` when
    /// there is nothing to write.
    async fn write<F>(&self, build: F) -> Result<Option<Cid>>
    where
        F: FnOnce(&CausalState) -> Result<Option<DeltaBuilder>>,
    {
        if self.cancel.is_cancelled() {
            return Err(ReplicaError::Closed);
        }

        let mut causal = self.causal.lock().await;
        let builder = match build(&*causal)? {
            Some(builder) => builder,
            None => return Ok(None),
        };
        let delta = builder
            .with_parents(causal.heads.to_vec())
            .with_priority(self.clock.tick())
            .build();

        let bytes = delta.encode()?;
        let expected = Cid::of(&bytes);
        let cid = self.dag.put(bytes).await?;
        if cid != expected {
            return Err(ReplicaError::Persistence(format!(
                "store returned {} for block {}",
                cid.short(),
                expected.short()
            )));
        }

        let outcome = causal.commit(cid, &delta)?;
        drop(causal);

        debug!(
            replica = %self.config.replica_id,
            cid = %cid.short(),
            priority = delta.priority,
            "local delta committed"
        );
        if let ApplyOutcome::Applied { changes } = outcome {
            for change in changes {
                self.emit(change.into());
            }
        }

        // The delta is durable; a lost announcement is repaired by rebroadcast.
        if let Err(err) = self.announce(vec![cid]).await {
            warn!(
                replica = %self.config.replica_id,
                cid = %cid.short(),
                error = %err,
                "announcement failed"
            );
        }
        Ok(Some(cid))
    }
}

/// A replica of the key-value store.
///
/// Opening a replica spawns its receive and rebroadcast loops on the current
/// tokio runtime; [`Replica::close`] stops them.
pub struct Replica {
    inner: Arc<Inner>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl Replica {
    /// Open a replica over the given stores and transport.
    ///
    /// A state store that already holds records should be rebuilt with
    /// [`Replica::recover`] once the heads are known.
    pub fn open(
        config: ReplicaConfig,
        dag: Arc<dyn DAGStore>,
        state: Arc<dyn MaterializedStore>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let clock = Arc::new(PriorityClock::new());
        let engine = MergeEngine::new(Arc::clone(&state), Arc::clone(&clock));
        let sync = SyncProcessor::new(Arc::clone(&dag), config.clone(), cancel.clone());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let inner = Arc::new(Inner {
            config,
            dag,
            state,
            broadcaster,
            clock,
            causal: Mutex::new(CausalState::new(engine)),
            sync,
            events,
            counters: Counters::default(),
            cancel,
            pending: parking_lot::Mutex::new(IndexSet::new()),
            in_flight: parking_lot::Mutex::new(HashSet::new()),
        });

        let mut tasks = JoinSet::new();
        tasks.spawn(receive_loop(Arc::clone(&inner)));
        tasks.spawn(rebroadcast_loop(Arc::clone(&inner)));
        info!(replica = %inner.config.replica_id, topic = %inner.config.topic, "replica opened");

        Replica {
            inner,
            tasks: parking_lot::Mutex::new(Some(tasks)),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.replica_id
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.inner.config
    }

    /// Write `value` under `key`, returning the new delta's identifier.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<Cid> {
        let key = key.into();
        let value = value.into();
        let cid = self
            .inner
            .write(|_| Ok(Some(DeltaBuilder::new().put(key, value))))
            .await?;
        cid.ok_or_else(|| ReplicaError::Persistence("put produced no delta".into()))
    }

    /// Delete `key`.
    ///
    /// Removes every addition this replica has seen for the key. Returns
    /// `None` without writing when the key has no live value.
    pub async fn delete(&self, key: &str) -> Result<Option<Cid>> {
        self.inner
            .write(|causal| {
                let anchors = causal
                    .engine
                    .record(key)?
                    .map(|record| record.live_anchors())
                    .unwrap_or_default();
                if anchors.is_empty() {
                    return Ok(None);
                }
                Ok(Some(DeltaBuilder::new().remove(key, anchors)))
            })
            .await
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .state
            .get(key)?
            .and_then(|record| record.value().map(<[u8]>::to_vec)))
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self
            .inner
            .state
            .get(key)?
            .is_some_and(|record| !record.is_tombstoned()))
    }

    /// Live keys starting with `prefix` and their values, in key order.
    pub fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .inner
            .state
            .scan(prefix)?
            .into_iter()
            .filter_map(|(key, record)| record.value().map(move |v| (key, v.to_vec())))
            .collect())
    }

    pub async fn heads(&self) -> Vec<Cid> {
        self.inner.heads().await
    }

    pub async fn is_applied(&self, cid: &Cid) -> bool {
        self.inner.causal.lock().await.engine.is_applied(cid)
    }

    /// Merge a head obtained out of band, with its whole causal past.
    pub async fn learn(&self, head: Cid) -> Result<LearnReport> {
        if self.inner.cancel.is_cancelled() {
            return Err(ReplicaError::Closed);
        }
        self.inner.learn(head).await
    }

    /// Announce the current heads right away.
    pub async fn announce_heads(&self) -> Result<()> {
        let heads = self.heads().await;
        if heads.is_empty() {
            return Ok(());
        }
        self.inner.announce(heads).await
    }

    /// Rebuild the materialized state from the DAG behind the current heads.
    ///
    /// On failure the state store may be partially rebuilt; calling
    /// `recover` again starts over.
    pub async fn recover(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(ReplicaError::Closed);
        }
        let mut causal = self.inner.causal.lock().await;
        let heads = causal.heads.to_vec();
        let history = self.inner.sync.history(&heads).await?;

        let engine = merge::replay(
            Arc::clone(&self.inner.state),
            Arc::clone(&self.inner.clock),
            history.iter().map(|(cid, delta)| (*cid, delta)),
        )?;
        causal.engine = engine;
        info!(
            replica = %self.inner.config.replica_id,
            deltas = history.len(),
            "state rebuilt from history"
        );
        Ok(())
    }

    /// Stream of events from this replica.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.inner.events.subscribe()
    }

    pub async fn stats(&self) -> ReplicaStats {
        let mut stats = {
            let causal = self.inner.causal.lock().await;
            ReplicaStats {
                replica_id: self.inner.config.replica_id.clone(),
                heads: causal.heads.to_vec(),
                applied: causal.engine.applied_count(),
                max_priority: self.inner.clock.current(),
                pending_heads: self.inner.pending.lock().iter().copied().collect(),
                ..ReplicaStats::default()
            }
        };
        self.inner.counters.fill(&mut stats);
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop the background tasks and abort in-flight fetches.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let tasks = self.tasks.lock().take();
        if let Some(mut tasks) = tasks {
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    warn!(replica = %self.inner.config.replica_id, error = %err, "task ended abnormally");
                }
            }
            info!(replica = %self.inner.config.replica_id, "replica closed");
        }
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
