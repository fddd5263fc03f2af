//! Typed column storage for one [`super::Cluster`] slot.
//!
//! Every column is still physically just a [`crate::array::Array`]: numeric
//! and nullable-numeric columns pack the value's bit pattern directly
//! (floats and doubles via `to_bits`/`from_bits`, so the array's
//! smallest-invertible-width policy preserves them exactly); variable-length
//! and set-valued columns (`String`, `Binary`, `BackLink`) store a ref to a
//! side allocation per row, using the column array's own `has_refs` tagging
//! to tell "no value" (`NULL_REF`) from a populated ref.

use crate::error::{Error, Result};
use crate::mem::SlabAlloc;
use crate::types::{Ref, TableKey, TaggedValue, NULL_REF};

use super::tree::CascadeState;
use super::ObjKey;

/// The schema-level type tag for one cluster column (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    IntNullable,
    Int,
    BoolNullable,
    Bool,
    Float,
    Double,
    String,
    Binary,
    Timestamp,
    /// A single stable reference to a row in another table.
    Key { target_table: TableKey },
    /// Zero or more incoming/outgoing links to rows in another table.
    BackLink { target_table: TableKey },
}

impl ColumnType {
    /// Column arrays for variable-length or set-valued types store refs;
    /// everything else packs its value inline.
    fn has_refs(&self) -> bool {
        matches!(
            self,
            ColumnType::String | ColumnType::Binary | ColumnType::BackLink { .. }
        )
    }

}

/// One named column in a table's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub col_type: ColumnType,
}

/// The ordered list of typed columns a [`super::Cluster`] stores one row of.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub columns: Vec<ColumnSpec>,
}

impl Schema {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// A decoded cell value, one variant per [`ColumnType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Bool(bool),
    Float(f32),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    Timestamp(i64),
    Key(ObjKey),
    BackLink(Vec<ObjKey>),
}

impl Value {
    fn check_type(&self, col_type: &ColumnType) -> Result<()> {
        let ok = matches!(
            (self, col_type),
            (Value::Null, ColumnType::IntNullable)
                | (Value::Null, ColumnType::BoolNullable)
                | (Value::Null, ColumnType::String)
                | (Value::Null, ColumnType::Binary)
                | (Value::Int(_), ColumnType::IntNullable)
                | (Value::Int(_), ColumnType::Int)
                | (Value::Bool(_), ColumnType::BoolNullable)
                | (Value::Bool(_), ColumnType::Bool)
                | (Value::Float(_), ColumnType::Float)
                | (Value::Double(_), ColumnType::Double)
                | (Value::String(_), ColumnType::String)
                | (Value::Binary(_), ColumnType::Binary)
                | (Value::Timestamp(_), ColumnType::Timestamp)
                | (Value::Key(_), ColumnType::Key { .. })
                | (Value::BackLink(_), ColumnType::BackLink { .. })
        );
        if ok {
            Ok(())
        } else {
            Err(Error::IllegalType(format!(
                "value {self:?} is not a {col_type:?}"
            )))
        }
    }
}

/// Create a fresh, empty column array for `col_type`.
pub fn create_column(alloc: &mut SlabAlloc, col_type: &ColumnType) -> Result<Ref> {
    Ok(crate::array::Array::new(alloc, col_type.has_refs(), false)?.ref_())
}

/// Write `value` at `index` in a column array, growing it by one slot if
/// `index == count()` (append) as callers of [`super::Cluster::insert`]
/// always do -- columns grow in lockstep with the key array.
pub fn insert_cell(
    alloc: &mut SlabAlloc,
    col_ref: Ref,
    index: u32,
    col_type: &ColumnType,
    value: &Value,
) -> Result<Ref> {
    value.check_type(col_type)?;
    let mut arr = crate::array::Array::at(alloc, col_ref)?;
    let raw = encode(alloc, col_type, value)?;
    arr.insert(alloc, index, raw)
}

/// Overwrite the value already at `index`.
pub fn set_cell(
    alloc: &mut SlabAlloc,
    col_ref: Ref,
    index: u32,
    col_type: &ColumnType,
    value: &Value,
) -> Result<Ref> {
    value.check_type(col_type)?;
    let mut arr = crate::array::Array::at(alloc, col_ref)?;
    free_cell_payload(alloc, col_ref, index, col_type)?;
    let raw = encode(alloc, col_type, value)?;
    arr.set(alloc, index, raw)
}

/// Decode the value stored at `index`.
pub fn get_cell(alloc: &SlabAlloc, col_ref: Ref, index: u32, col_type: &ColumnType) -> Result<Value> {
    let arr = crate::array::Array::at(alloc, col_ref)?;
    let raw = arr.get(alloc, index)?;
    decode(alloc, col_type, raw)
}

/// Erase the row at `index` from this column. For a `BackLink` column,
/// every linked row is first recorded in `cascade` (spec §4.4: "for every
/// backlink column first, nullify incoming links and collect cascade
/// targets").
pub fn erase_cell(
    alloc: &mut SlabAlloc,
    col_ref: Ref,
    index: u32,
    col_type: &ColumnType,
    cascade: &mut CascadeState,
) -> Result<Ref> {
    if let ColumnType::BackLink { target_table } = col_type {
        let arr = crate::array::Array::at(alloc, col_ref)?;
        let raw = arr.get(alloc, index)?;
        if let crate::types::TaggedValue::Ref(list_ref) = crate::types::untag(raw) {
            if list_ref != NULL_REF {
                let links = read_key_list(alloc, list_ref)?;
                for key in links {
                    cascade.push(*target_table, key);
                }
                crate::array::Array::at(alloc, list_ref)?.destroy(alloc);
            }
        }
    } else {
        free_cell_payload(alloc, col_ref, index, col_type)?;
    }
    let mut arr = crate::array::Array::at(alloc, col_ref)?;
    arr.erase(alloc, index)
}

/// Free any side allocation (`String`/`Binary` blob) a cell owns before its
/// slot is overwritten or erased. `BackLink` is handled by its caller
/// ([`erase_cell`]) since it also needs to populate `cascade`.
fn free_cell_payload(alloc: &mut SlabAlloc, col_ref: Ref, index: u32, col_type: &ColumnType) -> Result<()> {
    if !matches!(col_type, ColumnType::String | ColumnType::Binary) {
        return Ok(());
    }
    let arr = crate::array::Array::at(alloc, col_ref)?;
    let raw = arr.get(alloc, index)?;
    if let crate::types::TaggedValue::Ref(blob_ref) = crate::types::untag(raw) {
        if blob_ref != NULL_REF {
            free_blob(alloc, blob_ref)?;
        }
    }
    Ok(())
}

fn encode(alloc: &mut SlabAlloc, col_type: &ColumnType, value: &Value) -> Result<i64> {
    Ok(match (col_type, value) {
        (_, Value::Null) => 0,
        (_, Value::Int(v)) => *v,
        (_, Value::Bool(b)) => *b as i64,
        (_, Value::Float(f)) => f.to_bits() as i64,
        (_, Value::Double(d)) => d.to_bits() as i64,
        (_, Value::Timestamp(t)) => *t,
        (_, Value::Key(k)) => k.0,
        (_, Value::String(s)) => write_blob(alloc, s.as_bytes())? as i64,
        (_, Value::Binary(b)) => write_blob(alloc, b)? as i64,
        (_, Value::BackLink(keys)) => write_key_list(alloc, keys)? as i64,
    })
}

fn decode(alloc: &SlabAlloc, col_type: &ColumnType, raw: i64) -> Result<Value> {
    Ok(match col_type {
        ColumnType::IntNullable => {
            if raw == 0 {
                Value::Null
            } else {
                Value::Int(raw)
            }
        }
        ColumnType::Int => Value::Int(raw),
        ColumnType::BoolNullable => {
            if raw == 0 {
                Value::Null
            } else {
                Value::Bool(raw != 0)
            }
        }
        ColumnType::Bool => Value::Bool(raw != 0),
        ColumnType::Float => Value::Float(f32::from_bits(raw as u32)),
        ColumnType::Double => Value::Double(f64::from_bits(raw as u64)),
        ColumnType::Timestamp => Value::Timestamp(raw),
        ColumnType::Key { .. } => Value::Key(ObjKey(raw)),
        ColumnType::String | ColumnType::Binary => {
            let blob_ref = raw as Ref;
            if blob_ref == NULL_REF {
                Value::Null
            } else {
                let bytes = read_blob(alloc, blob_ref)?;
                if matches!(col_type, ColumnType::String) {
                    Value::String(String::from_utf8(bytes).map_err(|e| {
                        Error::IllegalType(format!("non-utf8 string column: {e}"))
                    })?)
                } else {
                    Value::Binary(bytes)
                }
            }
        }
        ColumnType::BackLink { .. } => {
            let list_ref = raw as Ref;
            if list_ref == NULL_REF {
                Value::BackLink(Vec::new())
            } else {
                Value::BackLink(read_key_list(alloc, list_ref)?)
            }
        }
    })
}

/// Crate-visible wrapper around [`write_blob`] for callers outside a typed
/// column -- the group catalog (component F) uses the same side-allocation
/// shape for table names and encoded schema blobs, neither of which is a
/// column cell.
pub(crate) fn write_blob_pub(alloc: &mut SlabAlloc, bytes: &[u8]) -> Result<Ref> {
    write_blob(alloc, bytes)
}

/// Crate-visible wrapper around [`read_blob`]; see [`write_blob_pub`].
pub(crate) fn read_blob_pub(alloc: &SlabAlloc, r: Ref) -> Result<Vec<u8>> {
    read_blob(alloc, r)
}

/// Relocate a blob allocated by [`write_blob`]/[`write_blob_pub`] to
/// durable storage via `sink`, for the commit writer (component E). A
/// no-op if the blob is already read-only; `NULL_REF` passes through.
pub(crate) fn relocate_blob(sink: &mut dyn crate::commit::FreeSpaceSink, r: Ref) -> Result<Ref> {
    if r == NULL_REF || sink.alloc().is_read_only(r) {
        return Ok(r);
    }
    let len_bytes = sink.alloc().translate(r, 4)?;
    let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    crate::commit::copy_bytes(sink, r, 4 + len)
}

/// Relocate a column array (and, for `String`/`Binary`/`BackLink`
/// columns, every cell's side allocation) to durable storage via `sink`.
pub(crate) fn relocate_column(
    sink: &mut dyn crate::commit::FreeSpaceSink,
    col_ref: Ref,
    col_type: &ColumnType,
) -> Result<Ref> {
    if sink.alloc().is_read_only(col_ref) {
        return Ok(col_ref);
    }
    if col_type.has_refs() {
        let count = crate::array::Array::at(sink.alloc(), col_ref)?.count();
        for i in 0..count {
            let cell_ref = match crate::array::Array::at(sink.alloc(), col_ref)?.get_as_ref(sink.alloc(), i)? {
                TaggedValue::Ref(r) => r,
                TaggedValue::Inline(_) => continue,
            };
            if cell_ref == NULL_REF {
                continue;
            }
            let new_ref = match col_type {
                ColumnType::String | ColumnType::Binary => relocate_blob(sink, cell_ref)?,
                ColumnType::BackLink { .. } => {
                    let size = crate::array::Array::at(sink.alloc(), cell_ref)?.byte_size();
                    crate::commit::copy_bytes(sink, cell_ref, size)?
                }
                _ => cell_ref,
            };
            if new_ref != cell_ref {
                let mut arr = crate::array::Array::at(sink.alloc(), col_ref)?;
                arr.set_as_ref(sink.alloc_mut(), i, new_ref)?;
            }
        }
    }
    let size = crate::array::Array::at(sink.alloc(), col_ref)?.byte_size();
    crate::commit::copy_bytes(sink, col_ref, size)
}

fn write_blob(alloc: &mut SlabAlloc, bytes: &[u8]) -> Result<Ref> {
    if bytes.is_empty() {
        return Ok(NULL_REF);
    }
    let r = alloc.alloc(4 + bytes.len())?;
    let dst = alloc.translate_mut(r, 4 + bytes.len())?;
    dst[..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    dst[4..].copy_from_slice(bytes);
    Ok(r)
}

fn read_blob(alloc: &SlabAlloc, r: Ref) -> Result<Vec<u8>> {
    let len_bytes = alloc.translate(r, 4)?;
    let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    Ok(alloc.translate(r, 4 + len)?[4..].to_vec())
}

fn free_blob(alloc: &mut SlabAlloc, r: Ref) -> Result<()> {
    let len_bytes = alloc.translate(r, 4)?;
    let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    alloc.free(r, 4 + len);
    Ok(())
}

fn write_key_list(alloc: &mut SlabAlloc, keys: &[ObjKey]) -> Result<Ref> {
    if keys.is_empty() {
        return Ok(NULL_REF);
    }
    let mut arr = crate::array::Array::new(alloc, false, false)?;
    for key in keys {
        arr.add(alloc, key.0)?;
    }
    Ok(arr.ref_())
}

fn read_key_list(alloc: &SlabAlloc, r: Ref) -> Result<Vec<ObjKey>> {
    let arr = crate::array::Array::at(alloc, r)?;
    (0..arr.count()).map(|i| Ok(ObjKey(arr.get(alloc, i)?))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;

    fn alloc() -> SlabAlloc {
        SlabAlloc::open_buffer(vec![0u8; 24], DatabaseConfig::in_memory())
    }

    #[test]
    fn int_nullable_round_trips_null_and_value() {
        let mut a = alloc();
        let col = create_column(&mut a, &ColumnType::IntNullable).unwrap();
        let col = insert_cell(&mut a, col, 0, &ColumnType::IntNullable, &Value::Null).unwrap();
        let col = insert_cell(&mut a, col, 1, &ColumnType::IntNullable, &Value::Int(42)).unwrap();
        assert_eq!(get_cell(&a, col, 0, &ColumnType::IntNullable).unwrap(), Value::Null);
        assert_eq!(
            get_cell(&a, col, 1, &ColumnType::IntNullable).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn double_round_trips_exact_bits() {
        for v in [0.0_f64, -1.5, f64::MIN_POSITIVE, std::f64::consts::PI, -0.0] {
            let mut a = alloc();
            let col = create_column(&mut a, &ColumnType::Double).unwrap();
            let col = insert_cell(&mut a, col, 0, &ColumnType::Double, &Value::Double(v)).unwrap();
            match get_cell(&a, col, 0, &ColumnType::Double).unwrap() {
                Value::Double(got) => assert_eq!(got.to_bits(), v.to_bits()),
                other => panic!("expected double, got {other:?}"),
            }
        }
    }

    #[test]
    fn string_round_trips_through_blob() {
        let mut a = alloc();
        let col = create_column(&mut a, &ColumnType::String).unwrap();
        let col = insert_cell(
            &mut a,
            col,
            0,
            &ColumnType::String,
            &Value::String("hello world".into()),
        )
        .unwrap();
        assert_eq!(
            get_cell(&a, col, 0, &ColumnType::String).unwrap(),
            Value::String("hello world".into())
        );
    }

    #[test]
    fn backlink_erase_collects_cascade_targets() {
        let mut a = alloc();
        let ty = ColumnType::BackLink { target_table: 7 };
        let col = create_column(&mut a, &ty).unwrap();
        let col = insert_cell(
            &mut a,
            col,
            0,
            &ty,
            &Value::BackLink(vec![ObjKey(1), ObjKey(2)]),
        )
        .unwrap();
        let mut cascade = CascadeState::default();
        erase_cell(&mut a, col, 0, &ty, &mut cascade).unwrap();
        let targets: Vec<_> = cascade.drain().collect();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.table_key == 7));
    }
}
