//! Component G: `SubscriptionStore` and `SyncMetadataSchemaVersions`, the
//! versioned query-descriptor catalog and the schema-version catalog layered
//! on top of the same `Group` storage every other component writes through
//! (spec §3, §4.6, §4.7).
//!
//! Both halves of this module are ordinary tables inside the owning
//! [`crate::group::Group`] -- a `sets` table, a `subscriptions` table, and a
//! `sync_internal_schemas` table -- rather than a separate file region, the
//! same way the teacher's `sombra-admin` crate builds its checkpoint/verify
//! tooling directly on `GraphDB`'s public surface instead of reaching into
//! pager internals.

pub mod schema_versions;
pub mod subscriptions;

pub use schema_versions::SchemaVersions;
pub use subscriptions::{
    MutableSubscriptionSet, StateChangeNotification, Subscription, SubscriptionSet,
    SubscriptionState, SubscriptionStore,
};

use crate::cluster::{ClusterTree, ObjKey, Value};
use crate::error::{Error, Result};
use crate::mem::SlabAlloc;

/// Smallest `ObjKey` greater than every key already in `tree`, or `0` if
/// empty. Both catalog tables in this module key rows by an internal
/// monotonic counter rather than anything callers choose, so this linear
/// scan (fine at catalog scale -- see [`ClusterTree::keys`]) is the only
/// place that decides a fresh row's identity.
pub(crate) fn next_key(tree: &ClusterTree, alloc: &SlabAlloc) -> Result<ObjKey> {
    let max = tree.keys(alloc)?.into_iter().map(|k| k.0).max();
    Ok(ObjKey(max.map(|m| m + 1).unwrap_or(0)))
}

/// Encode a list of row keys as a flat little-endian `i64` sequence, stored
/// in a `Binary` cell -- used for a set's ordered subscription-row list.
pub(crate) fn encode_key_list(keys: &[ObjKey]) -> Vec<u8> {
    let mut out = Vec::with_capacity(keys.len() * 8);
    for k in keys {
        out.extend_from_slice(&k.0.to_le_bytes());
    }
    out
}

pub(crate) fn decode_key_list(bytes: &[u8]) -> Vec<ObjKey> {
    bytes
        .chunks_exact(8)
        .map(|c| ObjKey(i64::from_le_bytes(c.try_into().unwrap())))
        .collect()
}

/// Read a `Binary` cell as raw bytes, treating `Value::Null` as empty --
/// the same "absent means empty list/string" convention
/// [`crate::cluster::column`] uses for `String`/`Binary` columns.
pub(crate) fn binary_or_empty(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Binary(b) => Ok(b.clone()),
        Value::Null => Ok(Vec::new()),
        other => Err(Error::IllegalType(format!("expected Binary cell, found {other:?}"))),
    }
}

pub(crate) fn string_or_none(value: &Value) -> Result<Option<String>> {
    match value {
        Value::String(s) => Ok(Some(s.clone())),
        Value::Null => Ok(None),
        other => Err(Error::IllegalType(format!("expected String cell, found {other:?}"))),
    }
}

pub(crate) fn required_int(value: &Value) -> Result<i64> {
    match value {
        Value::Int(v) => Ok(*v),
        other => Err(Error::IllegalType(format!("expected Int cell, found {other:?}"))),
    }
}

pub(crate) fn required_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(Error::IllegalType(format!("expected String cell, found {other:?}"))),
    }
}
