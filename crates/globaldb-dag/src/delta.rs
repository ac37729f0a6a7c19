//! Delta definition, builder and canonical codec.
//!
//! A delta is one node of the causal DAG. It carries:
//! - the identifiers of its causal parents (the heads it was built on)
//! - a priority, shared by every addition in the delta
//! - additions: `key -> value`
//! - removals: `key -> anchors`, the identifiers of the deltas whose
//!   additions for that key are superseded
//!
//! Every collection is a `BTree*`, so the `serde_json` encoding is canonical:
//! two logically identical deltas encode to the same bytes and therefore
//! share a [`Cid`], however they were assembled.

use crate::error::{DagError, Result};
use crate::hash::Cid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An immutable unit of change in the replicated store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Heads at creation time. Empty for a root delta.
    pub parents: BTreeSet<Cid>,

    /// Logical clock value, strictly above every priority the creator had
    /// observed in this delta's causal past.
    pub priority: u64,

    /// Values written by this delta.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additions: BTreeMap<String, Vec<u8>>,

    /// Removed additions, per key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub removals: BTreeMap<String, BTreeSet<Cid>>,
}

impl Delta {
    /// Check if this delta has no parents.
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// Check if the delta carries no change at all.
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    /// Iterate the `(key, value, priority)` triples of this delta.
    pub fn additions(&self) -> impl Iterator<Item = (&str, &[u8], u64)> + '_ {
        self.additions
            .iter()
            .map(move |(k, v)| (k.as_str(), v.as_slice(), self.priority))
    }

    /// Iterate the `(key, anchors)` pairs of this delta.
    pub fn removals(&self) -> impl Iterator<Item = (&str, &BTreeSet<Cid>)> + '_ {
        self.removals.iter().map(|(k, a)| (k.as_str(), a))
    }

    /// Keys touched by this delta, in order and without duplicates.
    pub fn keys(&self) -> BTreeSet<&str> {
        self.additions
            .keys()
            .chain(self.removals.keys())
            .map(String::as_str)
            .collect()
    }

    /// Canonical byte encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(DagError::from)
    }

    /// Decode a block fetched from the DAG store.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let delta: Delta = serde_json::from_slice(bytes)?;
        if delta.is_empty() {
            return Err(DagError::Malformed("delta carries no change".into()));
        }
        if delta.priority == 0 {
            return Err(DagError::Malformed("delta priority must be positive".into()));
        }
        Ok(delta)
    }

    /// Decode a block and check it against the identifier it was fetched by.
    pub fn decode_verified(cid: &Cid, bytes: &[u8]) -> Result<Self> {
        let computed = Cid::of(bytes);
        if computed != *cid {
            return Err(DagError::Malformed(format!(
                "content hash {} does not match requested {}",
                computed.short(),
                cid.short()
            )));
        }
        Self::decode(bytes)
    }

    /// Content identifier of this delta.
    pub fn cid(&self) -> Result<Cid> {
        Ok(Cid::of(&self.encode()?))
    }
}

/// Builder for creating deltas.
#[derive(Clone, Debug, Default)]
pub struct DeltaBuilder {
    delta: Delta,
}

impl DeltaBuilder {
    pub fn new() -> Self {
        DeltaBuilder::default()
    }

    /// Set the parent deltas.
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = Cid>) -> Self {
        self.delta.parents = parents.into_iter().collect();
        self
    }

    /// Add a single parent delta.
    pub fn with_parent(mut self, parent: Cid) -> Self {
        self.delta.parents.insert(parent);
        self
    }

    pub fn with_priority(mut self, priority: u64) -> Self {
        self.delta.priority = priority;
        self
    }

    /// Record a write of `value` under `key`.
    pub fn put(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.delta.additions.insert(key.into(), value.into());
        self
    }

    /// Record the removal of the additions of `key` made by `anchors`.
    pub fn remove(mut self, key: impl Into<String>, anchors: impl IntoIterator<Item = Cid>) -> Self {
        self.delta
            .removals
            .entry(key.into())
            .or_default()
            .extend(anchors);
        self
    }

    pub fn build(self) -> Delta {
        self.delta
    }
}
