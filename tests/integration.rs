//! Cross-component scenarios that exercise `group`, `commit`, and `sync`
//! together through a real file on disk, mirroring the teacher's split
//! between in-module unit tests and a root `tests/` directory for
//! multi-component flows (see `tests/integrity.rs` in the teacher).

use keyspan_core::cluster::{ColumnSpec, ColumnType, ObjKey, Schema, Value};
use keyspan_core::sync::{SchemaVersions, SubscriptionState, SubscriptionStore};
use keyspan_core::{DatabaseConfig, Group};

fn widgets_schema() -> Schema {
    Schema {
        columns: vec![ColumnSpec {
            name: "n".into(),
            col_type: ColumnType::Int,
        }],
    }
}

#[test]
fn commit_and_reopen_round_trips_table_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.keyspan");

    {
        let mut group = Group::open(&path, DatabaseConfig::production()).unwrap();
        let key = group.create_table("widgets", widgets_schema()).unwrap();
        group
            .with_table_mut(key, |alloc, tree| tree.insert(alloc, ObjKey(1), &[Value::Int(42)]))
            .unwrap();
        group.commit().unwrap();
    }

    let reopened = Group::open(&path, DatabaseConfig::production()).unwrap();
    let key = reopened.find_table("widgets").unwrap();
    let tree = reopened.cluster_tree(key).unwrap();
    assert_eq!(tree.size(reopened.alloc()).unwrap(), 1);
    assert_eq!(
        tree.get_row(reopened.alloc(), ObjKey(1)).unwrap(),
        vec![Value::Int(42)]
    );
}

/// S4/S5-adjacent: a `SubscriptionStore` layered on a file-backed `Group`
/// survives a commit + process-restart-equivalent reopen with its versions
/// and states intact.
#[test]
fn subscription_store_survives_commit_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.keyspan");

    {
        let group = Group::open(&path, DatabaseConfig::production()).unwrap();
        let mut store = SubscriptionStore::open(group).unwrap();

        let mut m1 = store.make_mutable_copy().unwrap();
        m1.insert_or_assign(Some("all".into()), "Widget", "TRUEPREDICATE", 1).unwrap();
        m1.commit(1).unwrap();

        let cursor = store.get_mutable_by_version(1).unwrap();
        cursor.update_state(SubscriptionState::Complete, None, 2).unwrap();

        store.flush().unwrap();
    }

    let group = Group::open(&path, DatabaseConfig::production()).unwrap();
    let store = SubscriptionStore::open(group).unwrap();
    let active = store.get_active().unwrap().expect("version 1 should be active");
    assert_eq!(active.version, 1);
    assert_eq!(active.subscriptions.len(), 1);
    assert_eq!(active.subscriptions[0].name.as_deref(), Some("all"));
}

/// S6: a read-only opener observes a legacy `flx_metadata` table as-is and
/// never runs the migration; a subsequent write-mode open migrates it.
#[test]
fn read_only_open_does_not_migrate_legacy_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.keyspan");

    let legacy_schema = Schema {
        columns: vec![ColumnSpec {
            name: "schema_version".into(),
            col_type: ColumnType::Int,
        }],
    };

    {
        let mut group = Group::open(&path, DatabaseConfig::production()).unwrap();
        let key = group.create_table("flx_metadata", legacy_schema).unwrap();
        group
            .with_table_mut(key, |alloc, tree| tree.insert(alloc, ObjKey(0), &[Value::Int(9)]))
            .unwrap();
        group.commit().unwrap();
    }

    {
        let read_only = Group::open_read_only(&path, DatabaseConfig::production()).unwrap();
        assert!(read_only.find_table("flx_metadata").is_some());
        assert_eq!(
            SchemaVersions::get_version_for(&read_only, "flx_subscription_store").unwrap(),
            None
        );
    }

    {
        let group = Group::open(&path, DatabaseConfig::production()).unwrap();
        assert!(group.find_table("flx_metadata").is_none());
        assert_eq!(
            SchemaVersions::get_version_for(&group, "flx_subscription_store").unwrap(),
            Some(9)
        );
    }
}
