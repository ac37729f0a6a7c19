//! Content identifiers for deltas.
//!
//! A [`Cid`] is the SHA-256 digest of a delta's canonical encoding. Its byte
//! order is also the tie-break order used by conflict resolution, so the
//! derived `Ord` must stay a plain lexicographic comparison of the digest.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A 32-byte SHA-256 content identifier.
///
/// Serializes as a hex string so it can key JSON maps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Create a content identifier from raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Cid(bytes)
    }

    /// Compute the identifier of a block.
    pub fn of(data: &[u8]) -> Self {
        Hasher::hash(data)
    }

    /// Get the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex of the full digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-digit hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Cid(bytes))
    }

    /// First four digest bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({}...)", self.short())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{:02x}", b))
    }
}

impl FromStr for Cid {
    type Err = crate::error::DagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::from_hex(s)
            .ok_or_else(|| crate::error::DagError::Malformed(format!("invalid cid: {}", s)))
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cid::from_hex(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid cid: {}", s)))
    }
}

/// Streaming digest over several slices, yielding the same [`Cid`] as
/// hashing their concatenation.
#[derive(Clone, Default)]
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Cid {
        Cid(self.0.finalize().into())
    }

    pub fn hash(data: &[u8]) -> Cid {
        Cid(Sha256::digest(data).into())
    }
}
