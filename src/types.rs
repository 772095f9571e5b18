//! Core types for the counts store.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Token id of a label or relationship type.
pub type TokenId = i32;

/// Sentinel label id meaning "any label".
pub const ANY_LABEL: TokenId = -1;

/// Sentinel relationship type id meaning "any type".
pub const ANY_RELATIONSHIP_TYPE: TokenId = -1;

/// Count value written for a key whose resolved count went negative.
///
/// Reads that resolve through this marker fail with
/// [`CountsError::InvalidCount`](crate::CountsError::InvalidCount).
pub const INVALID_COUNT: i64 = -1;

/// Transaction id as assigned by the upstream transaction log.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct TxId(pub u64);

impl TxId {
    /// Watermark of a store that has seen no transactions.
    pub const BASE: TxId = TxId(1);

    pub fn next(self) -> Self {
        TxId(self.0 + 1)
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a countable aggregate.
///
/// Keys are totally ordered: every node key sorts before every relationship
/// key, node keys by label, relationship keys by `(rel_type, start_label,
/// end_label)`. The order is the on-disk order of snapshot artifacts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CountsKey {
    /// Number of nodes carrying `label`, or all nodes for [`ANY_LABEL`].
    Node { label: TokenId },
    /// Number of relationships of `rel_type` from `start_label` to `end_label`.
    Relationship {
        rel_type: TokenId,
        start_label: TokenId,
        end_label: TokenId,
    },
}

impl CountsKey {
    pub fn node(label: TokenId) -> Self {
        CountsKey::Node { label }
    }

    /// Relationship key. Arguments follow the `(start, type, end)` shape of a
    /// relationship pattern; the sort order is type-major regardless.
    pub fn relationship(start_label: TokenId, rel_type: TokenId, end_label: TokenId) -> Self {
        CountsKey::Relationship {
            rel_type,
            start_label,
            end_label,
        }
    }

    /// Total node count key.
    pub fn all_nodes() -> Self {
        Self::node(ANY_LABEL)
    }

    /// Total relationship count key.
    pub fn all_relationships() -> Self {
        Self::relationship(ANY_LABEL, ANY_RELATIONSHIP_TYPE, ANY_LABEL)
    }

    pub fn is_node(&self) -> bool {
        matches!(self, CountsKey::Node { .. })
    }

    /// Discriminant byte used by the snapshot encoding.
    pub(crate) fn kind(&self) -> u8 {
        match self {
            CountsKey::Node { .. } => 1,
            CountsKey::Relationship { .. } => 2,
        }
    }
}

impl Ord for CountsKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (CountsKey::Node { label: a }, CountsKey::Node { label: b }) => a.cmp(b),
            (CountsKey::Node { .. }, CountsKey::Relationship { .. }) => Ordering::Less,
            (CountsKey::Relationship { .. }, CountsKey::Node { .. }) => Ordering::Greater,
            (
                CountsKey::Relationship {
                    rel_type: t1,
                    start_label: s1,
                    end_label: e1,
                },
                CountsKey::Relationship {
                    rel_type: t2,
                    start_label: s2,
                    end_label: e2,
                },
            ) => (t1, s1, e1).cmp(&(t2, s2, e2)),
        }
    }
}

impl PartialOrd for CountsKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn fmt_token(f: &mut fmt::Formatter<'_>, id: TokenId) -> fmt::Result {
    if id == ANY_LABEL {
        write!(f, "ANY")
    } else {
        write!(f, "{}", id)
    }
}

impl fmt::Display for CountsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CountsKey::Node { label } => {
                write!(f, "Node[label=")?;
                fmt_token(f, label)?;
                write!(f, "]")
            }
            CountsKey::Relationship {
                rel_type,
                start_label,
                end_label,
            } => {
                write!(f, "Relationship[type=")?;
                fmt_token(f, rel_type)?;
                write!(f, ", start=")?;
                fmt_token(f, start_label)?;
                write!(f, ", end=")?;
                fmt_token(f, end_label)?;
                write!(f, "]")
            }
        }
    }
}

impl fmt::Debug for CountsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A key together with its resolved count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEntry {
    pub key: CountsKey,
    pub count: i64,
}

/// Contiguous key range selected by a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPrefix {
    /// Every key.
    All,
    /// Every node key.
    Nodes,
    /// Every relationship key.
    Relationships,
    /// Relationship keys of one type, including its wildcarded aggregates.
    RelationshipType(TokenId),
    /// Relationship keys of one type and start label.
    RelationshipTypeStart(TokenId, TokenId),
}

impl KeyPrefix {
    pub fn matches(&self, key: &CountsKey) -> bool {
        match (*self, *key) {
            (KeyPrefix::All, _) => true,
            (KeyPrefix::Nodes, CountsKey::Node { .. }) => true,
            (KeyPrefix::Relationships, CountsKey::Relationship { .. }) => true,
            (KeyPrefix::RelationshipType(t), CountsKey::Relationship { rel_type, .. }) => {
                rel_type == t
            }
            (
                KeyPrefix::RelationshipTypeStart(t, s),
                CountsKey::Relationship {
                    rel_type,
                    start_label,
                    ..
                },
            ) => rel_type == t && start_label == s,
            _ => false,
        }
    }

    /// Position of a key relative to this prefix's range.
    ///
    /// `Less` means the key sorts before the range, `Greater` after it.
    pub(crate) fn locate(&self, key: &CountsKey) -> Ordering {
        if self.matches(key) {
            return Ordering::Equal;
        }
        match (*self, *key) {
            (KeyPrefix::All, _) => Ordering::Equal,
            (KeyPrefix::Nodes, _) => Ordering::Greater,
            (_, CountsKey::Node { .. }) => Ordering::Less,
            (KeyPrefix::RelationshipType(t), CountsKey::Relationship { rel_type, .. }) => {
                rel_type.cmp(&t)
            }
            (
                KeyPrefix::RelationshipTypeStart(t, s),
                CountsKey::Relationship {
                    rel_type,
                    start_label,
                    ..
                },
            ) => (rel_type, start_label).cmp(&(t, s)),
            (KeyPrefix::Relationships, CountsKey::Relationship { .. }) => Ordering::Equal,
        }
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreStats {
    /// Highest transaction whose effects are applied.
    pub watermark: TxId,
    /// Watermark of the current durable snapshot.
    pub durable_watermark: TxId,
    /// Generation number of the current snapshot artifact.
    pub generation: u64,
    /// Entries in the current snapshot.
    pub snapshot_entries: u64,
    /// Keys changed in the live diff layer.
    pub diff_entries: u64,
    /// Keys in a frozen layer awaiting rotation.
    pub frozen_entries: u64,
    /// Completed rotations since open.
    pub rotations: u64,
    /// Failed rotations since open.
    pub failed_rotations: u64,
    /// Transactions skipped by the apply gate since open.
    pub ignored_transactions: u64,
}
