//! Replica events and statistics.

use crate::error::ReplicaError;
use crate::merge::KeyChange;
use globaldb_dag::Cid;
use std::sync::atomic::{AtomicU64, Ordering};

/// Something observable that happened on a replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// A key became visible with `value`, from a local or remote delta.
    Put { key: String, value: Vec<u8> },
    /// A key became tombstoned.
    Delete { key: String },
    /// A remote head and its ancestors were merged.
    HeadMerged { head: Cid },
    /// A remote head could not be merged; it stays pending.
    SyncFailed { head: Cid, error: ReplicaError },
    /// A gossip payload could not be decoded and was dropped.
    MalformedMessage { reason: String },
}

impl From<KeyChange> for ReplicaEvent {
    fn from(change: KeyChange) -> Self {
        match change {
            KeyChange::Put { key, value } => ReplicaEvent::Put { key, value },
            KeyChange::Delete { key } => ReplicaEvent::Delete { key },
        }
    }
}

/// Snapshot of a replica's state and counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaStats {
    pub replica_id: String,
    pub heads: Vec<Cid>,
    pub applied: usize,
    pub max_priority: u64,
    /// Remote heads whose last learn failed, oldest first.
    pub pending_heads: Vec<Cid>,
    /// Pending heads dropped to stay within `max_pending_heads`.
    pub pending_evicted: u64,
    pub deltas_merged: u64,
    pub announcements: u64,
    pub rebroadcasts: u64,
    pub sync_failures: u64,
    pub malformed_messages: u64,
}

/// Running counters shared by the replica's tasks.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    deltas_merged: AtomicU64,
    announcements: AtomicU64,
    rebroadcasts: AtomicU64,
    sync_failures: AtomicU64,
    malformed_messages: AtomicU64,
    pending_evicted: AtomicU64,
}

impl Counters {
    pub fn merged(&self, deltas: usize) {
        self.deltas_merged.fetch_add(deltas as u64, Ordering::Relaxed);
    }

    pub fn announced(&self) {
        self.announcements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rebroadcast(&self) {
        self.rebroadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sync_failed(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self) {
        self.pending_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters into `stats`.
    pub fn fill(&self, stats: &mut ReplicaStats) {
        stats.deltas_merged = self.deltas_merged.load(Ordering::Relaxed);
        stats.announcements = self.announcements.load(Ordering::Relaxed);
        stats.rebroadcasts = self.rebroadcasts.load(Ordering::Relaxed);
        stats.sync_failures = self.sync_failures.load(Ordering::Relaxed);
        stats.malformed_messages = self.malformed_messages.load(Ordering::Relaxed);
        stats.pending_evicted = self.pending_evicted.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_fill() {
        let counters = Counters::default();
        counters.merged(3);
        counters.announced();
        counters.announced();
        counters.malformed();
        counters.evicted();

        let mut stats = ReplicaStats::default();
        counters.fill(&mut stats);
        assert_eq!(stats.deltas_merged, 3);
        assert_eq!(stats.announcements, 2);
        assert_eq!(stats.malformed_messages, 1);
        assert_eq!(stats.sync_failures, 0);
        assert_eq!(stats.pending_evicted, 1);
    }

    #[test]
    fn test_event_from_change() {
        let event: ReplicaEvent = KeyChange::Delete { key: "k".into() }.into();
        assert_eq!(event, ReplicaEvent::Delete { key: "k".into() });
    }
}
