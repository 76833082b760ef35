//! Core type definitions for ChunkIO
//!
//! Identifier newtypes and the small enums shared between the catalog and
//! the placement analyzer.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier for any catalog entity (system, bucket, pool, chunk,
/// block, node, ...). Stored in documents as a hyphenated UUID string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generate a new random identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse an identifier from its document (string) form.
    ///
    /// Returns `None` for anything that is not a well-formed identifier;
    /// callers use this to tell reference values apart from ordinary strings.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ObjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service mode of a storage node.
///
/// `None` (field absent in the node record) means the node serves normally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Node is being drained; its blocks are still readable but no longer
    /// count toward the replica target.
    Decommissioning,
    /// Node is administratively removed; its blocks are unreadable.
    Disabled,
}

/// Data placement mode of a tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataPlacement {
    /// Replicate the full chunk onto every pool of the tier.
    Mirror,
    /// Treat the tier's pools as one combined pool.
    Spread,
}

/// Logical layer of a chunk fragment.
///
/// Parity layers exist in the wire format but are not analyzed yet; only
/// data fragments are placed and repaired in this version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FragLayer {
    /// Data fragment
    D,
}

impl fmt::Display for FragLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::D => write!(f, "D"),
        }
    }
}

/// Placement rules extracted from a bucket's effective tier: the placement
/// mode and the ordered pool list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    /// Placement mode of the tier
    pub data_placement: DataPlacement,
    /// Pools of the tier, in declared order
    pub pools: Vec<ObjectId>,
}
