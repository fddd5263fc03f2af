//! `Cluster`: one leaf of a [`super::tree::ClusterTree`], holding up to
//! `bpnode_size` rows' worth of every typed column (spec §3, §4.4).

use crate::array::Array;
use crate::error::{Error, Result};
use crate::mem::SlabAlloc;
use crate::types::{tag_inline, Ref, TaggedValue, NULL_REF};

use super::column::{self, ColumnType, Schema, Value};
use super::tree::CascadeState;
use super::ObjKey;

/// The result of an insert that overflowed `bpnode_size` and split.
pub struct Split {
    pub new_leaf: Ref,
    pub split_key: ObjKey,
}

/// Accessor for one cluster leaf. Stateless beyond the ref -- every method
/// re-reads the backing array, matching [`crate::array::Array`]'s own
/// cheap-accessor convention.
pub struct Cluster;

impl Cluster {
    /// Allocate a fresh, empty cluster (compact form, row count 0) with one
    /// column array per `schema` entry.
    pub fn create(alloc: &mut SlabAlloc, schema: &Schema) -> Result<Ref> {
        let mut arr = Array::new(alloc, true, false)?;
        arr.add(alloc, tag_inline(0))?;
        for col in &schema.columns {
            let col_ref = column::create_column(alloc, &col.col_type)?;
            arr.add(alloc, col_ref as i64)?;
        }
        Ok(arr.ref_())
    }

    pub fn is_compact(alloc: &SlabAlloc, leaf: Ref) -> Result<bool> {
        let arr = Array::at(alloc, leaf)?;
        Ok(matches!(arr.get_as_ref(alloc, 0)?, TaggedValue::Inline(_)))
    }

    pub fn size(alloc: &SlabAlloc, leaf: Ref) -> Result<u32> {
        let arr = Array::at(alloc, leaf)?;
        match arr.get_as_ref(alloc, 0)? {
            TaggedValue::Inline(count) => Ok(count as u32),
            TaggedValue::Ref(key_ref) => Ok(Array::at(alloc, key_ref)?.count()),
        }
    }

    pub fn key_at(alloc: &SlabAlloc, leaf: Ref, index: u32) -> Result<ObjKey> {
        let arr = Array::at(alloc, leaf)?;
        match arr.get_as_ref(alloc, 0)? {
            TaggedValue::Inline(_) => Ok(ObjKey(index as i64)),
            TaggedValue::Ref(key_ref) => Ok(ObjKey(Array::at(alloc, key_ref)?.get(alloc, index)?)),
        }
    }

    /// Smallest index `i` such that `key_at(i) >= key`, or `size()` if no
    /// such index exists.
    pub fn lower_bound(alloc: &SlabAlloc, leaf: Ref, key: ObjKey) -> Result<u32> {
        let size = Self::size(alloc, leaf)?;
        if Self::is_compact(alloc, leaf)? {
            return Ok(if key.0 < 0 {
                0
            } else if key.0 as u32 >= size {
                size
            } else {
                key.0 as u32
            });
        }
        let mut lo = 0u32;
        let mut hi = size;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if Self::key_at(alloc, leaf, mid)? < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Locate `key` exactly, or `Err(InvalidKey)`.
    pub fn get_ndx(alloc: &SlabAlloc, leaf: Ref, key: ObjKey) -> Result<u32> {
        let idx = Self::lower_bound(alloc, leaf, key)?;
        if idx < Self::size(alloc, leaf)? && Self::key_at(alloc, leaf, idx)? == key {
            Ok(idx)
        } else {
            Err(Error::InvalidKey(key))
        }
    }

    fn column_ref(alloc: &SlabAlloc, leaf: Ref, col: usize) -> Result<Ref> {
        let arr = Array::at(alloc, leaf)?;
        match arr.get_as_ref(alloc, col as u32 + 1)? {
            TaggedValue::Ref(r) => Ok(r),
            TaggedValue::Inline(_) => {
                Err(Error::LogicError("column slot held an inline value".into()))
            }
        }
    }

    fn set_column_ref(alloc: &mut SlabAlloc, leaf: Ref, col: usize, new_ref: Ref) -> Result<Ref> {
        let mut arr = Array::at(alloc, leaf)?;
        arr.set_as_ref(alloc, col as u32 + 1, new_ref)
    }

    /// Force a compact-form leaf into general form by materializing an
    /// explicit `[0, 1, ..., size)` key array (spec §4.4: "Any out-of-sequence
    /// split forces `ensure_general_form()`").
    pub fn ensure_general_form(alloc: &mut SlabAlloc, leaf: Ref) -> Result<Ref> {
        if !Self::is_compact(alloc, leaf)? {
            return Ok(leaf);
        }
        let size = Self::size(alloc, leaf)?;
        let mut keys = Array::new(alloc, false, false)?;
        for i in 0..size {
            keys.add(alloc, i as i64)?;
        }
        let mut arr = Array::at(alloc, leaf)?;
        arr.set_as_ref(alloc, 0, keys.ref_())
    }

    pub fn get_row(alloc: &SlabAlloc, leaf: Ref, index: u32, schema: &Schema) -> Result<Vec<Value>> {
        schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let col_ref = Self::column_ref(alloc, leaf, i)?;
                column::get_cell(alloc, col_ref, index, &col.col_type)
            })
            .collect()
    }

    pub fn set_row(
        alloc: &mut SlabAlloc,
        leaf: Ref,
        index: u32,
        schema: &Schema,
        values: &[Value],
    ) -> Result<Ref> {
        let mut leaf = leaf;
        for (i, (col, value)) in schema.columns.iter().zip(values).enumerate() {
            let col_ref = Self::column_ref(alloc, leaf, i)?;
            let new_col_ref = column::set_cell(alloc, col_ref, index, &col.col_type, value)?;
            leaf = Self::set_column_ref(alloc, leaf, i, new_col_ref)?;
        }
        Ok(leaf)
    }

    /// Insert `values` under `key`. `bpnode_size` is the caller's
    /// [`crate::cluster::tree::BPNODE_SIZE`]; a leaf that grows past it is
    /// split per spec §4.4's "Splitting policy".
    pub fn insert(
        alloc: &mut SlabAlloc,
        leaf: Ref,
        schema: &Schema,
        key: ObjKey,
        values: &[Value],
        bpnode_size: u32,
    ) -> Result<(Ref, Option<Split>)> {
        let cur_size = Self::size(alloc, leaf)?;
        let idx = Self::lower_bound(alloc, leaf, key)?;
        if idx < cur_size && Self::key_at(alloc, leaf, idx)? == key {
            return Err(Error::InvalidKey(key));
        }

        let appended_last = idx == cur_size;
        let mut leaf = leaf;
        let stays_compact =
            Self::is_compact(alloc, leaf)? && appended_last && key.0 == cur_size as i64;
        if !stays_compact {
            leaf = Self::ensure_general_form(alloc, leaf)?;
        }

        if Self::is_compact(alloc, leaf)? {
            let mut arr = Array::at(alloc, leaf)?;
            arr.set(alloc, 0, tag_inline(cur_size as i64 + 1))?;
        } else {
            let key_ref = match Array::at(alloc, leaf)?.get_as_ref(alloc, 0)? {
                TaggedValue::Ref(r) => r,
                TaggedValue::Inline(_) => unreachable!("ensure_general_form just ran"),
            };
            let mut keys = Array::at(alloc, key_ref)?;
            let new_key_ref = keys.insert(alloc, idx, key.0)?;
            let mut arr = Array::at(alloc, leaf)?;
            leaf = arr.set_as_ref(alloc, 0, new_key_ref)?;
        }

        for (i, (col, value)) in schema.columns.iter().zip(values).enumerate() {
            let col_ref = Self::column_ref(alloc, leaf, i)?;
            let new_col_ref = column::insert_cell(alloc, col_ref, idx, &col.col_type, value)?;
            leaf = Self::set_column_ref(alloc, leaf, i, new_col_ref)?;
        }

        let new_size = cur_size + 1;
        if new_size <= bpnode_size {
            return Ok((leaf, None));
        }

        let split_start = if appended_last { new_size - 1 } else { idx };
        let split_key = Self::key_at(alloc, leaf, split_start)?;
        let new_leaf = Self::move_range_to_new_leaf(alloc, leaf, schema, split_start, new_size)?;
        Self::truncate_to(alloc, leaf, split_start)?;
        Ok((
            leaf,
            Some(Split {
                new_leaf,
                split_key,
            }),
        ))
    }

    /// Copy rows `[from, to)` of `src` into a brand-new general-form
    /// cluster, leaving `src` untouched.
    fn move_range_to_new_leaf(
        alloc: &mut SlabAlloc,
        src: Ref,
        schema: &Schema,
        from: u32,
        to: u32,
    ) -> Result<Ref> {
        let dst = Self::create(alloc, schema)?;
        Self::append_rows(alloc, dst, src, schema, from, to)
    }

    /// Append rows `[from, to)` of `src` onto the end of `dst`, in order.
    /// Shared by the split path (fresh `dst`) and [`Self::merge_from`]
    /// (existing `dst`).
    fn append_rows(
        alloc: &mut SlabAlloc,
        dst: Ref,
        src: Ref,
        schema: &Schema,
        from: u32,
        to: u32,
    ) -> Result<Ref> {
        let mut dst = dst;
        for i in from..to {
            let key = Self::key_at(alloc, src, i)?;
            let row = Self::get_row(alloc, src, i, schema)?;
            let (new_dst, split) = Self::insert(alloc, dst, schema, key, &row, u32::MAX)?;
            debug_assert!(split.is_none(), "u32::MAX cap never splits");
            dst = new_dst;
        }
        Ok(dst)
    }

    /// Drop every row at or past `new_size`, preserving the leaf's current
    /// form (compact stays compact since its remaining keys `0..new_size`
    /// are still exactly their index).
    fn truncate_to(alloc: &mut SlabAlloc, leaf: Ref, new_size: u32) -> Result<Ref> {
        let mut leaf = leaf;
        if Self::is_compact(alloc, leaf)? {
            let mut arr = Array::at(alloc, leaf)?;
            leaf = arr.set(alloc, 0, tag_inline(new_size as i64))?;
        } else {
            let key_ref = match Array::at(alloc, leaf)?.get_as_ref(alloc, 0)? {
                TaggedValue::Ref(r) => r,
                TaggedValue::Inline(_) => unreachable!(),
            };
            let mut keys = Array::at(alloc, key_ref)?;
            let new_key_ref = keys.truncate(alloc, new_size)?;
            let mut arr = Array::at(alloc, leaf)?;
            leaf = arr.set_as_ref(alloc, 0, new_key_ref)?;
        }
        let col_count = {
            let arr = Array::at(alloc, leaf)?;
            arr.count() - 1
        };
        for i in 0..col_count {
            let col_ref = Self::column_ref(alloc, leaf, i as usize)?;
            let mut col_arr = Array::at(alloc, col_ref)?;
            let new_col_ref = col_arr.truncate(alloc, new_size)?;
            leaf = Self::set_column_ref(alloc, leaf, i as usize, new_col_ref)?;
        }
        Ok(leaf)
    }

    /// Erase `key`, cascading through `BackLink` columns first.
    pub fn erase(
        alloc: &mut SlabAlloc,
        leaf: Ref,
        schema: &Schema,
        key: ObjKey,
        cascade: &mut CascadeState,
    ) -> Result<(Ref, u32)> {
        let idx = Self::get_ndx(alloc, leaf, key)?;
        let cur_size = Self::size(alloc, leaf)?;
        let mut leaf = leaf;

        for (i, col) in schema.columns.iter().enumerate() {
            let col_ref = Self::column_ref(alloc, leaf, i)?;
            let new_col_ref = column::erase_cell(alloc, col_ref, idx, &col.col_type, cascade)?;
            leaf = Self::set_column_ref(alloc, leaf, i, new_col_ref)?;
        }

        let compact = Self::is_compact(alloc, leaf)?;
        if compact && idx == cur_size - 1 {
            let mut arr = Array::at(alloc, leaf)?;
            leaf = arr.set(alloc, 0, tag_inline(cur_size as i64 - 1))?;
        } else {
            leaf = Self::ensure_general_form(alloc, leaf)?;
            let key_ref = match Array::at(alloc, leaf)?.get_as_ref(alloc, 0)? {
                TaggedValue::Ref(r) => r,
                TaggedValue::Inline(_) => unreachable!(),
            };
            let mut keys = Array::at(alloc, key_ref)?;
            let new_key_ref = keys.erase(alloc, idx)?;
            let mut arr = Array::at(alloc, leaf)?;
            leaf = arr.set_as_ref(alloc, 0, new_key_ref)?;
        }

        Ok((leaf, cur_size - 1))
    }

    /// Append every row of `right` onto the end of `left`, used by the
    /// merge policy (spec §4.4). `left`'s keys are assumed to all sort
    /// before `right`'s.
    pub fn merge_from(alloc: &mut SlabAlloc, left: Ref, right: Ref, schema: &Schema) -> Result<Ref> {
        let right_size = Self::size(alloc, right)?;
        Self::append_rows(alloc, left, right, schema, 0, right_size)
    }

    /// Copy this leaf (its key array, if general-form, and every column) out
    /// to durable storage via `sink`, for the commit writer (component E).
    /// A no-op if the leaf is already read-only.
    pub(crate) fn relocate(
        sink: &mut dyn crate::commit::FreeSpaceSink,
        leaf: Ref,
        schema: &Schema,
    ) -> Result<Ref> {
        if sink.alloc().is_read_only(leaf) {
            return Ok(leaf);
        }
        let mut leaf = leaf;
        if let TaggedValue::Ref(key_ref) = Array::at(sink.alloc(), leaf)?.get_as_ref(sink.alloc(), 0)? {
            if key_ref != NULL_REF {
                let size = Array::at(sink.alloc(), key_ref)?.byte_size();
                let new_key_ref = crate::commit::copy_bytes(sink, key_ref, size)?;
                if new_key_ref != key_ref {
                    let mut arr = Array::at(sink.alloc(), leaf)?;
                    leaf = arr.set_as_ref(sink.alloc_mut(), 0, new_key_ref)?;
                }
            }
        }
        for i in 0..schema.len() {
            let col_ref = Self::column_ref(sink.alloc(), leaf, i)?;
            let new_col_ref = column::relocate_column(sink, col_ref, &schema.columns[i].col_type)?;
            if new_col_ref != col_ref {
                leaf = Self::set_column_ref(sink.alloc_mut(), leaf, i, new_col_ref)?;
            }
        }
        let size = Array::at(sink.alloc(), leaf)?.byte_size();
        crate::commit::copy_bytes(sink, leaf, size)
    }

    pub fn destroy(alloc: &mut SlabAlloc, leaf: Ref, schema: &Schema) -> Result<()> {
        let arr = Array::at(alloc, leaf)?;
        if let TaggedValue::Ref(key_ref) = arr.get_as_ref(alloc, 0)? {
            if key_ref != NULL_REF {
                Array::at(alloc, key_ref)?.destroy(alloc);
            }
        }
        for i in 0..schema.len() {
            let col_ref = Self::column_ref(alloc, leaf, i)?;
            Array::at(alloc, col_ref)?.destroy(alloc);
        }
        Array::at(alloc, leaf)?.destroy(alloc);
        Ok(())
    }
}
