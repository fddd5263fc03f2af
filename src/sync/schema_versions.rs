//! `SchemaVersions`: a one-table catalog mapping a named schema group to an
//! integer version (spec §4.7).
//!
//! The legacy `flx_metadata` -> `sync_internal_schemas` migration itself
//! lives on [`crate::group::Group::open_with_alloc`] rather than here --
//! it runs once, at open time, before any table accessor (this one
//! included) exists yet, the same way the teacher's `GraphDB::open_with_config`
//! runs its own one-shot index-rebuild before returning a usable handle.
//! This type is the ongoing read/write surface over whatever table that
//! migration (or a fresh `create_table` call) left behind.

use crate::cluster::{ColumnSpec, ColumnType, Schema, Value};
use crate::error::Result;
use crate::group::Group;

use super::{next_key, required_string};

/// Unified schema-version table name (spec §6).
pub const TABLE_NAME: &str = "sync_internal_schemas";

/// Recognized schema-group names (spec §6), for callers that want a
/// compile-time-checked constant instead of a string literal.
pub mod group_names {
    pub const FLX_SUBSCRIPTION_STORE: &str = "flx_subscription_store";
    pub const PENDING_BOOTSTRAPS: &str = "pending_bootstraps";
    pub const FLX_MIGRATION_STORE: &str = "flx_migration_store";
}

/// Read/write accessor over the `sync_internal_schemas` table. Stateless --
/// every call re-resolves the table from the owning [`Group`], so there is
/// nothing to keep in sync if the table doesn't exist yet.
pub struct SchemaVersions;

impl SchemaVersions {
    pub fn schema() -> Schema {
        Schema {
            columns: vec![
                ColumnSpec {
                    name: "group_name".into(),
                    col_type: ColumnType::String,
                },
                ColumnSpec {
                    name: "version".into(),
                    col_type: ColumnType::Int,
                },
            ],
        }
    }

    /// `None` if the table doesn't exist yet or `group` has no row --
    /// including, per spec §4.7, for a read-only opener that never ran the
    /// legacy migration.
    pub fn get_version_for(group: &Group, group_name: &str) -> Result<Option<i64>> {
        let Some(key) = group.find_table(TABLE_NAME) else {
            return Ok(None);
        };
        let tree = group.cluster_tree(key)?;
        for row_key in tree.keys(group.alloc())? {
            let row = tree.get_row(group.alloc(), row_key)?;
            if required_string(&row[0])? == group_name {
                return Ok(Some(super::required_int(&row[1])?));
            }
        }
        Ok(None)
    }

    /// Create the table on first write (spec §4.7), then insert or update
    /// `group_name`'s row.
    pub fn set_version_for(group: &mut Group, group_name: &str, version: i64) -> Result<()> {
        let table = match group.find_table(TABLE_NAME) {
            Some(k) => k,
            None => group.create_table(TABLE_NAME, Self::schema())?,
        };

        let existing_key = {
            let tree = group.cluster_tree(table)?;
            let mut found = None;
            for row_key in tree.keys(group.alloc())? {
                let row = tree.get_row(group.alloc(), row_key)?;
                if required_string(&row[0])? == group_name {
                    found = Some(row_key);
                    break;
                }
            }
            found
        };

        group.with_table_mut(table, |alloc, tree| match existing_key {
            Some(row_key) => tree.set_row(
                alloc,
                row_key,
                &[Value::String(group_name.to_string()), Value::Int(version)],
            ),
            None => {
                let key = next_key(tree, alloc)?;
                tree.insert(
                    alloc,
                    key,
                    &[Value::String(group_name.to_string()), Value::Int(version)],
                )
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::mem::SlabAlloc;

    fn group() -> Group {
        Group::create(SlabAlloc::open_buffer(vec![0u8; 24], DatabaseConfig::in_memory())).unwrap()
    }

    #[test]
    fn absent_table_is_none() {
        let g = group();
        assert_eq!(
            SchemaVersions::get_version_for(&g, group_names::FLX_SUBSCRIPTION_STORE).unwrap(),
            None
        );
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut g = group();
        SchemaVersions::set_version_for(&mut g, group_names::FLX_SUBSCRIPTION_STORE, 3).unwrap();
        assert_eq!(
            SchemaVersions::get_version_for(&g, group_names::FLX_SUBSCRIPTION_STORE).unwrap(),
            Some(3)
        );
    }

    #[test]
    fn set_version_for_updates_existing_row_in_place() {
        let mut g = group();
        SchemaVersions::set_version_for(&mut g, "pending_bootstraps", 1).unwrap();
        SchemaVersions::set_version_for(&mut g, "pending_bootstraps", 2).unwrap();
        assert_eq!(
            SchemaVersions::get_version_for(&g, "pending_bootstraps").unwrap(),
            Some(2)
        );
        let table = g.find_table(TABLE_NAME).unwrap();
        assert_eq!(g.cluster_tree(table).unwrap().size(g.alloc()).unwrap(), 1);
    }
}
