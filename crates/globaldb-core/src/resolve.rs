//! Conflict resolution order.
//!
//! Concurrent additions to the same key are ranked by `(priority, cid)`:
//! the higher priority wins, and equal priorities fall back to the larger
//! delta identifier. The order is total and depends only on delta content,
//! so every replica picks the same winner whatever the arrival order.

use globaldb_dag::Cid;
use std::cmp::Ordering;

/// Rank of one addition. Field order matters: the derived `Ord` compares
/// `priority` first, then `cid`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub priority: u64,
    pub cid: Cid,
}

impl Version {
    pub fn new(priority: u64, cid: Cid) -> Self {
        Version { priority, cid }
    }

    /// Whether an addition ranked `self` replaces one ranked `other`.
    pub fn supersedes(&self, other: &Version) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

/// Pick the winning version among candidates.
pub fn winner<I>(candidates: I) -> Option<Version>
where
    I: IntoIterator<Item = Version>,
{
    candidates.into_iter().max()
}
