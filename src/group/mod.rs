//! Component F: `Group`, the top-level container -- table catalog,
//! free-space lists, and the commit entry point (spec §3, §4.5).
//!
//! A `Group`'s top array holds four refs: `{table-names, tables,
//! free-position, free-length}`. Each slot of the `tables` array is itself a
//! 2-element wrapper `[cluster_tree_root, schema_blob]` rather than a bare
//! `ClusterTree` root -- the spec's data model names a schema per table
//! (`Cluster`'s "one column array per schema column") but never specifies
//! where that schema is persisted, so this crate stores it alongside the
//! tree root through one extra level of indirection, the same way a
//! `Cluster`'s own column slots are just further array refs (see
//! `DESIGN.md`).

use std::path::Path;

use tracing::warn;

use crate::array::Array;
use crate::cluster::{ColumnSpec, ColumnType, ObjKey, Schema};
use crate::cluster::tree::{ClusterTree, DEFAULT_BPNODE_SIZE};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::mem::{SlabAlloc, HEADER_SIZE};
use crate::types::{Ref, TableKey, TaggedValue, NULL_REF};

/// 16-byte file signature following the 8-byte top-ref (spec §6, §9 open
/// question: the original's exact magic is not determined from the
/// excerpt; this crate mints its own and checks it on open).
pub const FILE_SIGNATURE: [u8; 16] = *b"KEYSPANCOREv0001";

/// Top-level container for one database: table catalog plus free-space
/// bookkeeping.
pub struct Group {
    alloc: SlabAlloc,
    pub(crate) top_ref: Ref,
    pub(crate) table_names: Ref,
    pub(crate) tables: Ref,
    pub(crate) free_pos: Ref,
    pub(crate) free_len: Ref,
    bpnode_size: u32,
}

impl Group {
    /// Create a brand-new, empty database backed by `alloc`. Nothing is
    /// written to the file until [`Self::commit`].
    pub fn create(mut alloc: SlabAlloc) -> Result<Self> {
        let table_names = Array::new(&mut alloc, true, false)?.ref_();
        let tables = Array::new(&mut alloc, true, false)?.ref_();
        let free_pos = Array::new(&mut alloc, false, false)?.ref_();
        let free_len = Array::new(&mut alloc, false, false)?.ref_();
        Ok(Self {
            alloc,
            top_ref: NULL_REF,
            table_names,
            tables,
            free_pos,
            free_len,
            bpnode_size: DEFAULT_BPNODE_SIZE,
        })
    }

    /// Open (creating if necessary) a file-backed database.
    pub fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let alloc = SlabAlloc::open_file(path, config)?;
        Self::open_with_alloc(alloc)
    }

    /// Open an existing file strictly for reading. `commit()` is rejected,
    /// and the legacy `flx_metadata` migration (spec §4.7) never runs --
    /// a read-only opener sees the legacy table as absent if it has not
    /// already been migrated by some earlier write-mode opener.
    pub fn open_read_only(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let alloc = SlabAlloc::open_file_read_only(path, config)?;
        Self::open_with_alloc(alloc)
    }

    /// Open an allocator already holding bytes (file or in-memory buffer).
    pub fn open_with_alloc(mut alloc: SlabAlloc) -> Result<Self> {
        if alloc.file_len() < HEADER_SIZE {
            return Self::create(alloc);
        }
        let signature = alloc.read_raw(8, 16)?;
        if signature != FILE_SIGNATURE {
            return Err(Error::InvalidDatabase(
                "file signature does not match this crate's format".into(),
            ));
        }
        let top_ref = alloc.read_top_ref()?;
        if top_ref == NULL_REF {
            return Self::create(alloc);
        }
        let top = Array::at(&alloc, top_ref)?;
        let table_names = Self::ref_slot(&alloc, &top, 0)?;
        let tables = Self::ref_slot(&alloc, &top, 1)?;
        let free_pos = Self::ref_slot(&alloc, &top, 2)?;
        let free_len = Self::ref_slot(&alloc, &top, 3)?;
        let mut group = Self {
            alloc,
            top_ref,
            table_names,
            tables,
            free_pos,
            free_len,
            bpnode_size: DEFAULT_BPNODE_SIZE,
        };
        group.migrate_legacy_metadata_if_present()?;
        Ok(group)
    }

    fn ref_slot(alloc: &SlabAlloc, arr: &Array, index: u32) -> Result<Ref> {
        match arr.get_as_ref(alloc, index)? {
            TaggedValue::Ref(r) => Ok(r),
            TaggedValue::Inline(_) => Err(Error::InvalidDatabase(format!(
                "top array slot {index} held an inline value"
            ))),
        }
    }

    pub fn alloc(&self) -> &SlabAlloc {
        &self.alloc
    }

    pub fn alloc_mut(&mut self) -> &mut SlabAlloc {
        &mut self.alloc
    }

    pub fn bpnode_size(&self) -> u32 {
        self.bpnode_size
    }

    /// Per spec §4.7: a read-only opener never migrates; only a write-mode
    /// caller that goes on to `commit()` completes the transition. This
    /// crate treats "has a writable allocator" as write-mode, matching
    /// `SlabAlloc::can_persist`.
    fn migrate_legacy_metadata_if_present(&mut self) -> Result<()> {
        if !self.alloc.can_persist() {
            return Ok(());
        }
        let Some(legacy_key) = self.find_table("flx_metadata") else {
            return Ok(());
        };
        let legacy_schema = self.schema(legacy_key)?.clone();
        if legacy_schema.len() != 1 || legacy_schema.columns[0].name != "schema_version" {
            return Ok(());
        }
        warn!("migrating legacy flx_metadata table");
        let tree = self.cluster_tree(legacy_key)?;
        if tree.size(&self.alloc)? != 1 {
            return Ok(());
        }
        let version = match tree.get_row(&self.alloc, ObjKey(0))?.into_iter().next() {
            Some(crate::cluster::Value::Int(v)) => v,
            _ => return Ok(()),
        };

        crate::sync::SchemaVersions::set_version_for(
            self,
            crate::sync::schema_versions::group_names::FLX_SUBSCRIPTION_STORE,
            version,
        )?;
        self.drop_table(legacy_key)?;
        self.commit()?;
        Ok(())
    }

    fn table_count(&self) -> Result<u32> {
        Ok(Array::at(&self.alloc, self.tables)?.count())
    }

    /// Every table name currently in the catalog, in table-key order
    /// (dropped tables leave a `NULL_REF` slot and are skipped).
    pub fn table_names(&self) -> Result<Vec<String>> {
        let count = self.table_count()?;
        let mut names = Vec::new();
        for key in 0..count {
            if self.table_wrapper_ref(key)? != NULL_REF {
                names.push(self.table_name(key)?);
            }
        }
        Ok(names)
    }

    /// `(entry count, total free bytes)` across the free-position/free-length
    /// lists -- a `keyspan-inspect open` diagnostic (spec §6).
    pub fn free_list_summary(&self) -> Result<(u32, u64)> {
        let count = Array::at(&self.alloc, self.free_len)?.count();
        let mut total = 0u64;
        for i in 0..count {
            total += Array::at(&self.alloc, self.free_len)?.get(&self.alloc, i)? as u64;
        }
        Ok((count, total))
    }

    pub fn top_ref(&self) -> Ref {
        self.top_ref
    }

    pub fn file_len(&self) -> u64 {
        self.alloc.file_len()
    }

    pub fn table_name(&self, key: TableKey) -> Result<String> {
        let names = Array::at(&self.alloc, self.table_names)?;
        let blob_ref = match names.get_as_ref(&self.alloc, key)? {
            TaggedValue::Ref(r) => r,
            TaggedValue::Inline(_) => {
                return Err(Error::LogicError("table name slot held an inline value".into()))
            }
        };
        let bytes = crate::cluster::column::read_blob_pub(&self.alloc, blob_ref)?;
        String::from_utf8(bytes)
            .map_err(|e| Error::InvalidDatabase(format!("non-utf8 table name: {e}")))
    }

    pub fn find_table(&self, name: &str) -> Option<TableKey> {
        let count = self.table_count().ok()?;
        (0..count).find(|&i| {
            self.table_wrapper_ref(i).map(|r| r != NULL_REF).unwrap_or(false)
                && self.table_name(i).map(|n| n == name).unwrap_or(false)
        })
    }

    fn table_wrapper_ref(&self, key: TableKey) -> Result<Ref> {
        let tables = Array::at(&self.alloc, self.tables)?;
        match tables.get_as_ref(&self.alloc, key)? {
            TaggedValue::Ref(r) => Ok(r),
            TaggedValue::Inline(_) => Err(Error::LogicError("table slot held an inline value".into())),
        }
    }

    pub fn schema(&self, key: TableKey) -> Result<Schema> {
        let wrapper = Array::at(&self.alloc, self.table_wrapper_ref(key)?)?;
        let schema_blob = match wrapper.get_as_ref(&self.alloc, 1)? {
            TaggedValue::Ref(r) => r,
            TaggedValue::Inline(_) => {
                return Err(Error::LogicError("schema slot held an inline value".into()))
            }
        };
        decode_schema(&self.alloc, schema_blob)
    }

    pub fn cluster_tree(&self, key: TableKey) -> Result<ClusterTree> {
        let wrapper = Array::at(&self.alloc, self.table_wrapper_ref(key)?)?;
        let root = match wrapper.get_as_ref(&self.alloc, 0)? {
            TaggedValue::Ref(r) => r,
            TaggedValue::Inline(_) => {
                return Err(Error::LogicError("table root slot held an inline value".into()))
            }
        };
        Ok(ClusterTree::from_root(root, self.schema(key)?, self.bpnode_size))
    }

    /// Run `f` against the table's tree and write its (possibly relocated)
    /// root back into the table catalog.
    pub fn with_table_mut<R>(
        &mut self,
        key: TableKey,
        f: impl FnOnce(&mut SlabAlloc, &mut ClusterTree) -> Result<R>,
    ) -> Result<R> {
        let mut tree = self.cluster_tree(key)?;
        let result = f(&mut self.alloc, &mut tree)?;
        let wrapper_ref = self.table_wrapper_ref(key)?;
        let mut wrapper = Array::at(&self.alloc, wrapper_ref)?;
        let new_wrapper_ref = wrapper.set_as_ref(&mut self.alloc, 0, tree.root_ref())?;
        let mut tables = Array::at(&self.alloc, self.tables)?;
        self.tables = tables.set_as_ref(&mut self.alloc, key, new_wrapper_ref)?;
        Ok(result)
    }

    pub fn create_table(&mut self, name: &str, schema: Schema) -> Result<TableKey> {
        if self.find_table(name).is_some() {
            return Err(Error::IllegalCombination(format!("table {name} already exists")));
        }
        let key = self.table_count()?;
        let root = crate::cluster::Cluster::create(&mut self.alloc, &schema)?;
        let schema_blob = encode_schema(&mut self.alloc, &schema)?;
        let mut wrapper = Array::new(&mut self.alloc, true, false)?;
        wrapper.add(&mut self.alloc, root as i64)?;
        wrapper.add(&mut self.alloc, schema_blob as i64)?;

        let name_blob = crate::cluster::column::write_blob_pub(&mut self.alloc, name.as_bytes())?;
        let mut names = Array::at(&self.alloc, self.table_names)?;
        self.table_names = names.add(&mut self.alloc, name_blob as i64)?;
        let mut tables = Array::at(&self.alloc, self.tables)?;
        self.tables = tables.add(&mut self.alloc, wrapper.ref_() as i64)?;
        Ok(key)
    }

    /// Refuses with [`Error::CrossTableLinkTarget`] if any other table's
    /// schema still has a `Key`/`BackLink` column targeting this one (spec
    /// §7).
    pub fn drop_table(&mut self, key: TableKey) -> Result<()> {
        let count = self.table_count()?;
        for other in 0..count {
            if other == key {
                continue;
            }
            let schema = self.schema(other)?;
            for col in &schema.columns {
                let target = match &col.col_type {
                    ColumnType::Key { target_table } | ColumnType::BackLink { target_table } => {
                        Some(*target_table)
                    }
                    _ => None,
                };
                if target == Some(key) {
                    return Err(Error::CrossTableLinkTarget(format!(
                        "table {other} column {} still targets table {key}",
                        col.name
                    )));
                }
            }
        }
        let mut tables = Array::at(&self.alloc, self.tables)?;
        self.tables = tables.set_as_ref(&mut self.alloc, key, NULL_REF)?;
        Ok(())
    }

    /// First-fit free-space allocation (spec §4.5). Returns the file
    /// position of a region of at least `len` bytes, mutating the free-list
    /// arrays to reflect the consumption.
    pub(crate) fn get_free_space(&mut self, len: u64) -> Result<u64> {
        let count = Array::at(&self.alloc, self.free_len)?.count();
        let mut found = None;
        for i in 0..count {
            let entry_len = Array::at(&self.alloc, self.free_len)?.get(&self.alloc, i)? as u64;
            if entry_len >= len {
                found = Some((i, entry_len));
                break;
            }
        }
        if let Some((i, entry_len)) = found {
            let pos = Array::at(&self.alloc, self.free_pos)?.get(&self.alloc, i)? as u64;
            if entry_len == len {
                let mut pos_arr = Array::at(&self.alloc, self.free_pos)?;
                self.free_pos = pos_arr.erase(&mut self.alloc, i)?;
                let mut len_arr = Array::at(&self.alloc, self.free_len)?;
                self.free_len = len_arr.erase(&mut self.alloc, i)?;
            } else {
                let mut pos_arr = Array::at(&self.alloc, self.free_pos)?;
                self.free_pos = pos_arr.set(&mut self.alloc, i, (pos + len) as i64)?;
                let mut len_arr = Array::at(&self.alloc, self.free_len)?;
                self.free_len = len_arr.set(&mut self.alloc, i, (entry_len - len) as i64)?;
            }
            return Ok(pos);
        }

        let old_len = self.alloc.file_len_for_extend();
        let new_len = self.alloc.extend_to(old_len + len)?;
        let leftover = new_len - (old_len + len);
        if leftover > 0 {
            let mut pos_arr = Array::at(&self.alloc, self.free_pos)?;
            self.free_pos = pos_arr.add(&mut self.alloc, (old_len + len) as i64)?;
            let mut len_arr = Array::at(&self.alloc, self.free_len)?;
            self.free_len = len_arr.add(&mut self.alloc, leftover as i64)?;
        }
        Ok(old_len)
    }

    /// Two-phase commit (spec §4.5). A no-op on an in-memory (non-file)
    /// allocator beyond validating it isn't attempted (spec §6).
    pub fn commit(&mut self) -> Result<crate::commit::CommitStats> {
        if !self.alloc.can_persist() {
            return Err(Error::IllegalCombination(
                "commit() is not permitted on an in-memory-buffer database".into(),
            ));
        }
        crate::commit::GroupWriter::commit(self)
    }

    /// Step 1 of commit (spec §4.5): copy every dirty array reachable from
    /// the table-names and tables catalogs -- and, recursively, every
    /// table's row tree -- out to durable storage. Read-only subtrees
    /// (nothing changed since the last commit) are untouched.
    pub(crate) fn relocate_catalog_for_commit(&mut self) -> Result<()> {
        if !self.alloc.is_read_only(self.table_names) {
            let count = Array::at(&self.alloc, self.table_names)?.count();
            let mut names = self.table_names;
            for i in 0..count {
                let blob_ref = match Array::at(&self.alloc, names)?.get_as_ref(&self.alloc, i)? {
                    TaggedValue::Ref(r) => r,
                    TaggedValue::Inline(_) => continue,
                };
                if blob_ref == NULL_REF {
                    continue;
                }
                let new_ref = crate::cluster::column::relocate_blob(self, blob_ref)?;
                if new_ref != blob_ref {
                    let mut arr = Array::at(&self.alloc, names)?;
                    names = arr.set_as_ref(&mut self.alloc, i, new_ref)?;
                }
            }
            let size = Array::at(&self.alloc, names)?.byte_size();
            self.table_names = crate::commit::copy_bytes(self, names, size)?;
        }

        if !self.alloc.is_read_only(self.tables) {
            let count = self.table_count()?;
            let mut tables = self.tables;
            for key in 0..count {
                let wrapper_ref = match Array::at(&self.alloc, tables)?.get_as_ref(&self.alloc, key)? {
                    TaggedValue::Ref(r) => r,
                    TaggedValue::Inline(_) => continue,
                };
                if wrapper_ref == NULL_REF {
                    continue;
                }
                let new_wrapper = self.relocate_table_wrapper(wrapper_ref, key)?;
                if new_wrapper != wrapper_ref {
                    let mut arr = Array::at(&self.alloc, tables)?;
                    tables = arr.set_as_ref(&mut self.alloc, key, new_wrapper)?;
                }
            }
            let size = Array::at(&self.alloc, tables)?.byte_size();
            self.tables = crate::commit::copy_bytes(self, tables, size)?;
        }
        Ok(())
    }

    fn relocate_table_wrapper(&mut self, wrapper_ref: Ref, key: TableKey) -> Result<Ref> {
        if self.alloc.is_read_only(wrapper_ref) {
            return Ok(wrapper_ref);
        }
        let schema = self.schema(key)?;
        let mut wrapper = wrapper_ref;

        let root = match Array::at(&self.alloc, wrapper)?.get_as_ref(&self.alloc, 0)? {
            TaggedValue::Ref(r) => r,
            TaggedValue::Inline(_) => {
                return Err(Error::LogicError("table root slot held an inline value".into()))
            }
        };
        let mut tree = ClusterTree::from_root(root, schema, self.bpnode_size);
        tree.relocate_to_file(self)?;
        if tree.root_ref() != root {
            let mut arr = Array::at(&self.alloc, wrapper)?;
            wrapper = arr.set_as_ref(&mut self.alloc, 0, tree.root_ref())?;
        }

        let schema_blob = match Array::at(&self.alloc, wrapper)?.get_as_ref(&self.alloc, 1)? {
            TaggedValue::Ref(r) => r,
            TaggedValue::Inline(_) => {
                return Err(Error::LogicError("schema slot held an inline value".into()))
            }
        };
        let new_schema_blob = crate::cluster::column::relocate_blob(self, schema_blob)?;
        if new_schema_blob != schema_blob {
            let mut arr = Array::at(&self.alloc, wrapper)?;
            wrapper = arr.set_as_ref(&mut self.alloc, 1, new_schema_blob)?;
        }

        let size = Array::at(&self.alloc, wrapper)?.byte_size();
        crate::commit::copy_bytes(self, wrapper, size)
    }
}

fn encode_schema(alloc: &mut SlabAlloc, schema: &Schema) -> Result<Ref> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(schema.columns.len() as u32).to_le_bytes());
    for col in &schema.columns {
        let (tag, target): (u8, TableKey) = match col.col_type {
            ColumnType::IntNullable => (0, 0),
            ColumnType::Int => (1, 0),
            ColumnType::BoolNullable => (2, 0),
            ColumnType::Bool => (3, 0),
            ColumnType::Float => (4, 0),
            ColumnType::Double => (5, 0),
            ColumnType::String => (6, 0),
            ColumnType::Binary => (7, 0),
            ColumnType::Timestamp => (8, 0),
            ColumnType::Key { target_table } => (9, target_table),
            ColumnType::BackLink { target_table } => (10, target_table),
        };
        bytes.push(tag);
        bytes.extend_from_slice(&target.to_le_bytes());
        let name = col.name.as_bytes();
        bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(name);
    }
    crate::cluster::column::write_blob_pub(alloc, &bytes)
}

fn decode_schema(alloc: &SlabAlloc, blob_ref: Ref) -> Result<Schema> {
    let bytes = crate::cluster::column::read_blob_pub(alloc, blob_ref)?;
    let mut pos = 0usize;
    let count = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
    pos += 4;
    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = bytes[pos];
        pos += 1;
        let target = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let name_len = u16::from_le_bytes(bytes[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let name = String::from_utf8(bytes[pos..pos + name_len].to_vec())
            .map_err(|e| Error::InvalidDatabase(format!("non-utf8 column name: {e}")))?;
        pos += name_len;
        let col_type = match tag {
            0 => ColumnType::IntNullable,
            1 => ColumnType::Int,
            2 => ColumnType::BoolNullable,
            3 => ColumnType::Bool,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::String,
            7 => ColumnType::Binary,
            8 => ColumnType::Timestamp,
            9 => ColumnType::Key { target_table: target },
            10 => ColumnType::BackLink { target_table: target },
            other => {
                return Err(Error::InvalidDatabase(format!("unknown column type tag {other}")))
            }
        };
        columns.push(ColumnSpec { name, col_type });
    }
    Ok(Schema { columns })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema {
            columns: vec![ColumnSpec {
                name: "n".into(),
                col_type: ColumnType::Int,
            }],
        }
    }

    #[test]
    fn create_table_then_find_and_insert() {
        let mut g = Group::create(SlabAlloc::open_buffer(vec![0u8; 24], DatabaseConfig::in_memory())).unwrap();
        let key = g.create_table("widgets", schema()).unwrap();
        assert_eq!(g.find_table("widgets"), Some(key));
        g.with_table_mut(key, |alloc, tree| {
            tree.insert(alloc, ObjKey(1), &[crate::cluster::Value::Int(42)])
        })
        .unwrap();
        let tree = g.cluster_tree(key).unwrap();
        assert_eq!(tree.size(g.alloc()).unwrap(), 1);
    }

    #[test]
    fn drop_table_refused_while_targeted() {
        let mut g = Group::create(SlabAlloc::open_buffer(vec![0u8; 24], DatabaseConfig::in_memory())).unwrap();
        let widgets = g.create_table("widgets", schema()).unwrap();
        let gadgets_schema = Schema {
            columns: vec![ColumnSpec {
                name: "widget".into(),
                col_type: ColumnType::Key { target_table: widgets },
            }],
        };
        g.create_table("gadgets", gadgets_schema).unwrap();
        assert!(matches!(
            g.drop_table(widgets),
            Err(Error::CrossTableLinkTarget(_))
        ));
    }

    #[test]
    fn duplicate_table_name_rejected() {
        let mut g = Group::create(SlabAlloc::open_buffer(vec![0u8; 24], DatabaseConfig::in_memory())).unwrap();
        g.create_table("widgets", schema()).unwrap();
        assert!(g.create_table("widgets", schema()).is_err());
    }
}
