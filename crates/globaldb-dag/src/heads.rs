//! The causal frontier of the local DAG.

use crate::hash::Cid;
use std::collections::BTreeSet;

/// Set of delta identifiers that have no known descendant.
///
/// Invariant: no member is a causal ancestor of another member. It holds as
/// long as every applied delta goes through [`HeadSet::advance`] after all of
/// its parents did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadSet {
    heads: BTreeSet<Cid>,
}

impl HeadSet {
    pub fn new() -> Self {
        HeadSet::default()
    }

    /// Record `cid` as applied: it becomes a head and every parent that was
    /// a head stops being one.
    pub fn advance<'a>(&mut self, cid: Cid, parents: impl IntoIterator<Item = &'a Cid>) {
        for parent in parents {
            self.heads.remove(parent);
        }
        self.heads.insert(cid);
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.heads.contains(cid)
    }

    /// Current heads in identifier order.
    pub fn to_vec(&self) -> Vec<Cid> {
        self.heads.iter().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cid> {
        self.heads.iter()
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}
