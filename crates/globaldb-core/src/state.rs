//! Materialized key-value state.
//!
//! Each key maps to a [`KeyRecord`]: the additions that are still live, the
//! identifiers of additions that were removed, and the cached winner among
//! the live ones. Keeping the removed identifiers makes the record a pure
//! function of the set of applied deltas, so arrival order never matters.

use crate::resolve::Version;
use globaldb_dag::Cid;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// A live addition for a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub priority: u64,
    pub value: Vec<u8>,
}

/// The addition currently holding a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winner {
    pub cid: Cid,
    pub priority: u64,
    pub value: Vec<u8>,
}

impl Winner {
    pub fn version(&self) -> Version {
        Version::new(self.priority, self.cid)
    }
}

/// Materialized state of one key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Additions not covered by any applied removal, by delta identifier.
    pub entries: BTreeMap<Cid, Entry>,
    /// Delta identifiers whose additions for this key were removed.
    pub removed: BTreeSet<Cid>,
    /// Highest-ranked live addition.
    pub current: Option<Winner>,
}

impl KeyRecord {
    pub fn new() -> Self {
        KeyRecord::default()
    }

    /// Current value, if the key is not tombstoned.
    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|w| w.value.as_slice())
    }

    /// Priority of the current value, 0 when tombstoned.
    pub fn priority(&self) -> u64 {
        self.current.as_ref().map_or(0, |w| w.priority)
    }

    /// A key that has seen additions, all of them removed.
    pub fn is_tombstoned(&self) -> bool {
        self.current.is_none()
    }

    /// Record the addition made by delta `cid`.
    ///
    /// An addition whose identifier was already removed stays dead.
    pub fn add(&mut self, cid: Cid, priority: u64, value: &[u8]) {
        if self.removed.contains(&cid) {
            return;
        }
        self.entries.insert(
            cid,
            Entry {
                priority,
                value: value.to_vec(),
            },
        );

        let candidate = Version::new(priority, cid);
        let replaces = match &self.current {
            Some(current) => candidate.supersedes(&current.version()),
            None => true,
        };
        if replaces {
            self.current = Some(Winner {
                cid,
                priority,
                value: value.to_vec(),
            });
        }
    }

    /// Remove the additions made by `anchors`.
    pub fn remove<'a>(&mut self, anchors: impl IntoIterator<Item = &'a Cid>) {
        let mut lost_winner = false;
        for anchor in anchors {
            self.removed.insert(*anchor);
            self.entries.remove(anchor);
            if self.current.as_ref().is_some_and(|w| w.cid == *anchor) {
                lost_winner = true;
            }
        }
        if lost_winner {
            self.current = self
                .entries
                .iter()
                .max_by_key(|(cid, entry)| Version::new(entry.priority, **cid))
                .map(|(cid, entry)| Winner {
                    cid: *cid,
                    priority: entry.priority,
                    value: entry.value.clone(),
                });
        }
    }

    /// Identifiers of the live additions, used as anchors by a local delete.
    pub fn live_anchors(&self) -> BTreeSet<Cid> {
        self.entries.keys().copied().collect()
    }
}

/// Errors raised by a materialized store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt state record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Durable mapping from key to [`KeyRecord`].
///
/// Writes come only from the merge engine, which is serialized by the
/// replica; readers may run concurrently.
pub trait MaterializedStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<KeyRecord>, StateError>;

    /// Write every record of a batch, or none of them.
    fn write_batch(&self, batch: Vec<(String, KeyRecord)>) -> Result<(), StateError>;

    /// All records whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, KeyRecord)>, StateError>;

    /// Drop every record.
    fn clear(&self) -> Result<(), StateError>;
}

/// In-memory implementation of [`MaterializedStore`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<BTreeMap<String, KeyRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        MemoryStateStore::default()
    }

    /// Toggle failure of subsequent writes.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Copy of every record, for comparisons.
    pub fn snapshot(&self) -> BTreeMap<String, KeyRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MaterializedStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<KeyRecord>, StateError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn write_batch(&self, batch: Vec<(String, KeyRecord)>) -> Result<(), StateError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StateError::Unavailable("write rejected".into()));
        }
        let mut records = self.records.write();
        records.extend(batch);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, KeyRecord)>, StateError> {
        Ok(self
            .records
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect())
    }

    fn clear(&self) -> Result<(), StateError> {
        self.records.write().clear();
        Ok(())
    }
}
