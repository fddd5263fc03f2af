//! Component D: `Cluster`/`ClusterTree`, the row-storage B+-tree.
//!
//! A `ClusterTree` is keyed by a sparse, signed [`ObjKey`] rather than the
//! dense `[0, size)` index [`crate::btree::BPlusTree`] uses, so it is a
//! distinct (if structurally similar) tree, built directly on
//! [`crate::array::Array`] rather than on the generic tree: its inner nodes
//! carry a cumulative key offset, not a cumulative element count, and its
//! leaves (`Cluster`) hold one column per schema entry rather than a single
//! payload.

pub mod column;
pub mod leaf;
pub mod tree;

pub use column::{ColumnSpec, ColumnType, Schema, Value};
pub use leaf::Cluster;
pub use tree::{CascadeState, ClusterTree};

use crate::types::TableKey;

/// Stable, signed row identifier. Unrelated to the dense index a
/// [`crate::btree::BPlusTree`] uses -- two rows keep the same `ObjKey`
/// across inserts and erases elsewhere in the table (spec §3).
///
/// Negative values are reserved for unresolved ("tombstone") keys, e.g. a
/// row created locally before a sync server has assigned it a permanent
/// identity; this crate does not itself assign them; it only preserves the
/// ordering and equality callers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjKey(pub i64);

impl ObjKey {
    /// True for a tombstone (unresolved, pre-sync) key.
    pub fn is_unresolved(&self) -> bool {
        self.0 < 0
    }
}

impl std::fmt::Display for ObjKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One cascaded link severed by an erase: the row `obj_key` in table
/// `table_key` pointed at the row being erased and now needs its own
/// incoming-link bookkeeping reconciled by the caller (spec §4.4, §7
/// `CrossTableLinkTarget` is the *refusal* counterpart of this for tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeTarget {
    pub table_key: TableKey,
    pub obj_key: ObjKey,
}
