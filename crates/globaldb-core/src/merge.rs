//! Merge engine: applies deltas to the materialized state.
//!
//! `apply` is idempotent per delta identifier and refuses deltas whose
//! parents have not been applied. Every record touched by one delta is
//! written in a single batch; the applied set and the clock only move once
//! that batch is durable, so a failed write leaves nothing half-applied.

use crate::clock::PriorityClock;
use crate::error::{ReplicaError, Result};
use crate::state::{KeyRecord, MaterializedStore};
use globaldb_dag::{Cid, Delta};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// A visible change caused by applying a delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyChange {
    /// The key now reads `value`.
    Put { key: String, value: Vec<u8> },
    /// The key became tombstoned.
    Delete { key: String },
}

/// Result of [`MergeEngine::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The delta had been applied before; nothing changed.
    AlreadyApplied,
    /// The delta was merged.
    Applied { changes: Vec<KeyChange> },
}

impl ApplyOutcome {
    pub fn changes(&self) -> &[KeyChange] {
        match self {
            ApplyOutcome::AlreadyApplied => &[],
            ApplyOutcome::Applied { changes } => changes,
        }
    }
}

/// Applies deltas in causal order and tracks which ones were applied.
pub struct MergeEngine {
    store: Arc<dyn MaterializedStore>,
    applied: HashSet<Cid>,
    clock: Arc<PriorityClock>,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn MaterializedStore>, clock: Arc<PriorityClock>) -> Self {
        MergeEngine {
            store,
            applied: HashSet::new(),
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn MaterializedStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<PriorityClock> {
        &self.clock
    }

    pub fn is_applied(&self, cid: &Cid) -> bool {
        self.applied.contains(cid)
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Merge `delta`, identified by `cid`, into the materialized state.
    #[tracing::instrument(skip_all, fields(cid = %cid.short(), priority = delta.priority))]
    pub fn apply(&mut self, cid: Cid, delta: &Delta) -> Result<ApplyOutcome> {
        if self.applied.contains(&cid) {
            trace!("already applied");
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if let Some(missing) = delta.parents.iter().find(|p| !self.applied.contains(p)) {
            return Err(ReplicaError::CausalGap {
                delta: cid,
                missing: *missing,
            });
        }

        let mut batch = Vec::new();
        let mut changes = Vec::new();

        for key in delta.keys() {
            let mut record = self.store.get(key)?.unwrap_or_default();
            let before = record.value().map(<[u8]>::to_vec);

            if let Some(anchors) = delta.removals.get(key) {
                if let Some(pending) = anchors.iter().find(|a| !self.applied.contains(a)) {
                    debug!(key, anchor = %pending.short(), "removal anchor not applied yet");
                }
                record.remove(anchors);
            }
            if let Some(value) = delta.additions.get(key) {
                record.add(cid, delta.priority, value);
            }

            let after = record.value();
            match (before.as_deref(), after) {
                (b, Some(a)) if b != Some(a) => changes.push(KeyChange::Put {
                    key: key.to_string(),
                    value: a.to_vec(),
                }),
                (Some(_), None) => changes.push(KeyChange::Delete {
                    key: key.to_string(),
                }),
                _ => {}
            }
            batch.push((key.to_string(), record));
        }

        self.store.write_batch(batch)?;
        self.applied.insert(cid);
        self.clock.observe(delta.priority);

        debug!(changes = changes.len(), "delta applied");
        Ok(ApplyOutcome::Applied { changes })
    }

    /// Current record of a key.
    pub fn record(&self, key: &str) -> Result<Option<KeyRecord>> {
        Ok(self.store.get(key)?)
    }
}

/// Rebuild state from a causally ordered history into `store`.
///
/// Deltas must be listed parents-first; anything else fails with
/// [`ReplicaError::CausalGap`].
pub fn replay<'a, I>(
    store: Arc<dyn MaterializedStore>,
    clock: Arc<PriorityClock>,
    history: I,
) -> Result<MergeEngine>
where
    I: IntoIterator<Item = (Cid, &'a Delta)>,
{
    store.clear()?;
    let mut engine = MergeEngine::new(store, clock);
    for (cid, delta) in history {
        engine.apply(cid, delta)?;
    }
    Ok(engine)
}
