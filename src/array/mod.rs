//! Component B: `Array`, the single node type every B+-tree level, cluster
//! leaf column and cluster inner node is built from.
//!
//! An array is a fixed 8-byte header followed by a bit-packed payload (see
//! [`pack`]). Header layout:
//!
//! ```text
//! byte 0       : flags (bit0 has_refs, bit1 is_inner_bptree_node, bit2 context_flag)
//! byte 1       : width code, indexes into pack::WIDTHS
//! bytes 2..6   : element count, u32 little-endian
//! bytes 6..8   : reserved, always zero
//! ```
//!
//! Mutation always goes through [`Array::copy_on_write`] first: an array
//! whose ref is below the allocator's baseline is part of the last
//! committed, immutable snapshot, so any change must relocate it into a
//! fresh, writable ref. Every mutating method here returns the array's
//! (possibly new) ref; the caller -- a B+-tree inner node, a cluster, or
//! `Group`'s top array -- is responsible for writing that ref back into its
//! own slot. This is the explicit, non-pointer stand-in for the original's
//! parent-pointer update (spec §9): instead of a node holding a pointer
//! back to its parent, every level from `Group`'s top array down to a leaf
//! threads the new ref back up through ordinary return values.

pub mod pack;

use crate::error::{Error, Result};
use crate::mem::SlabAlloc;
use crate::types::Ref;

const HEADER_SIZE: usize = 8;

const FLAG_HAS_REFS: u8 = 1 << 0;
const FLAG_INNER_BPTREE_NODE: u8 = 1 << 1;
const FLAG_CONTEXT: u8 = 1 << 2;

/// An accessor for one array node. Cheap to construct; holds only the
/// header fields read at the time of [`Array::at`] or [`Array::new`], not a
/// borrow of the allocator.
#[derive(Debug, Clone, Copy)]
pub struct Array {
    ref_: Ref,
    width_bits: u8,
    count: u32,
    has_refs: bool,
    is_inner_bptree_node: bool,
    context_flag: bool,
}

impl Array {
    /// Allocate a brand new, empty array.
    pub fn new(
        alloc: &mut SlabAlloc,
        has_refs: bool,
        is_inner_bptree_node: bool,
    ) -> Result<Self> {
        let ref_ = alloc.alloc(HEADER_SIZE)?;
        let mut array = Self {
            ref_,
            width_bits: 0,
            count: 0,
            has_refs,
            is_inner_bptree_node,
            context_flag: false,
        };
        array.write_header(alloc)?;
        Ok(array)
    }

    /// Read an existing array's header.
    pub fn at(alloc: &SlabAlloc, ref_: Ref) -> Result<Self> {
        let header = alloc.translate(ref_, HEADER_SIZE)?;
        let flags = header[0];
        let width_bits = pack::width_from_code(header[1]);
        let count = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
        Ok(Self {
            ref_,
            width_bits,
            count,
            has_refs: flags & FLAG_HAS_REFS != 0,
            is_inner_bptree_node: flags & FLAG_INNER_BPTREE_NODE != 0,
            context_flag: flags & FLAG_CONTEXT != 0,
        })
    }

    pub fn ref_(&self) -> Ref {
        self.ref_
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn has_refs(&self) -> bool {
        self.has_refs
    }

    pub fn is_inner_bptree_node(&self) -> bool {
        self.is_inner_bptree_node
    }

    pub fn context_flag(&self) -> bool {
        self.context_flag
    }

    pub fn set_context_flag(&mut self, alloc: &mut SlabAlloc, value: bool) -> Result<Ref> {
        self.copy_on_write(alloc)?;
        self.context_flag = value;
        self.write_header(alloc)?;
        Ok(self.ref_)
    }

    fn flags_byte(&self) -> u8 {
        let mut b = 0u8;
        if self.has_refs {
            b |= FLAG_HAS_REFS;
        }
        if self.is_inner_bptree_node {
            b |= FLAG_INNER_BPTREE_NODE;
        }
        if self.context_flag {
            b |= FLAG_CONTEXT;
        }
        b
    }

    fn write_header(&self, alloc: &mut SlabAlloc) -> Result<()> {
        let header = alloc.translate_mut(self.ref_, HEADER_SIZE)?;
        header[0] = self.flags_byte();
        header[1] = pack::width_code(self.width_bits);
        header[2..6].copy_from_slice(&self.count.to_le_bytes());
        header[6] = 0;
        header[7] = 0;
        Ok(())
    }

    /// Total header-plus-payload byte span of this array's current
    /// representation. Exposed crate-wide: the commit writer (component E)
    /// needs it to copy a dirty array's raw bytes out to a fresh file
    /// position without re-deriving the packing math itself.
    pub(crate) fn byte_size(&self) -> usize {
        HEADER_SIZE + pack::bytes_for(self.width_bits, self.count)
    }

    /// If `self.ref_` is in the read-only region, relocate the whole array
    /// (header + payload) into a freshly allocated writable ref. No-op for
    /// an already-writable array.
    pub fn copy_on_write(&mut self, alloc: &mut SlabAlloc) -> Result<bool> {
        if !alloc.is_read_only(self.ref_) {
            return Ok(false);
        }
        let size = self.byte_size();
        let bytes = alloc.translate(self.ref_, size)?.to_vec();
        let new_ref = alloc.alloc(size)?;
        alloc.translate_mut(new_ref, size)?.copy_from_slice(&bytes);
        self.ref_ = new_ref;
        Ok(true)
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.count {
            Err(Error::OutOfBounds {
                index: index as usize,
                size: self.count as usize,
            })
        } else {
            Ok(())
        }
    }

    pub fn get(&self, alloc: &SlabAlloc, index: u32) -> Result<i64> {
        self.check_index(index)?;
        if self.width_bits == 0 {
            return Ok(0);
        }
        let bytes = alloc.translate(self.ref_, self.byte_size())?;
        Ok(pack::read(
            &bytes[HEADER_SIZE..],
            self.width_bits,
            index,
            self.has_refs,
        ))
    }

    /// Decode slot `index` as either an inline integer or a child ref.
    /// Only meaningful when `has_refs()` is true.
    pub fn get_as_ref(&self, alloc: &SlabAlloc, index: u32) -> Result<crate::types::TaggedValue> {
        debug_assert!(self.has_refs, "get_as_ref on a plain integer array");
        Ok(crate::types::untag(self.get(alloc, index)?))
    }

    /// Grow the array's width (never shrinks) and rewrite every existing
    /// element at the new width. Called before a `set`/`insert` whose value
    /// doesn't fit the current width.
    fn ensure_width(&mut self, alloc: &mut SlabAlloc, needed: u8) -> Result<()> {
        if needed <= self.width_bits {
            return Ok(());
        }
        let old_payload_len = pack::bytes_for(self.width_bits, self.count);
        let old_values: Vec<i64> = if self.width_bits == 0 {
            vec![0; self.count as usize]
        } else {
            let bytes = alloc.translate(self.ref_, HEADER_SIZE + old_payload_len)?;
            (0..self.count)
                .map(|i| pack::read(&bytes[HEADER_SIZE..], self.width_bits, i, self.has_refs))
                .collect()
        };
        let new_payload_len = pack::bytes_for(needed, self.count);
        let new_size = HEADER_SIZE + new_payload_len;
        let new_ref = alloc.realloc(self.ref_, self.byte_size(), new_size)?;
        self.ref_ = new_ref;
        self.width_bits = needed;
        let bytes = alloc.translate_mut(self.ref_, new_size)?;
        bytes[HEADER_SIZE..].fill(0);
        for (i, v) in old_values.into_iter().enumerate() {
            pack::write(&mut bytes[HEADER_SIZE..], needed, i as u32, v);
        }
        self.write_header(alloc)?;
        Ok(())
    }

    pub fn set(&mut self, alloc: &mut SlabAlloc, index: u32, value: i64) -> Result<Ref> {
        self.check_index(index)?;
        self.copy_on_write(alloc)?;
        let needed = pack::min_width_for(value, self.has_refs).max(self.width_bits);
        self.ensure_width(alloc, needed)?;
        let size = self.byte_size();
        let bytes = alloc.translate_mut(self.ref_, size)?;
        pack::write(&mut bytes[HEADER_SIZE..], self.width_bits, index, value);
        Ok(self.ref_)
    }

    pub fn set_as_ref(&mut self, alloc: &mut SlabAlloc, index: u32, child: Ref) -> Result<Ref> {
        self.set(alloc, index, child as i64)
    }

    /// Insert `value` at `index`, shifting later elements up. `index ==
    /// count()` appends.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, index: u32, value: i64) -> Result<Ref> {
        if index > self.count {
            return Err(Error::OutOfBounds {
                index: index as usize,
                size: self.count as usize,
            });
        }
        self.copy_on_write(alloc)?;
        let needed = pack::min_width_for(value, self.has_refs).max(self.width_bits.max(1));
        // Read out existing elements (at current width) before resizing.
        let old_count = self.count;
        let old_values: Vec<i64> = (0..old_count)
            .map(|i| {
                if self.width_bits == 0 {
                    0
                } else {
                    let bytes = alloc
                        .translate(self.ref_, self.byte_size())
                        .expect("just copy-on-wrote this ref");
                    pack::read(&bytes[HEADER_SIZE..], self.width_bits, i, self.has_refs)
                }
            })
            .collect();

        self.count = old_count + 1;
        let new_payload_len = pack::bytes_for(needed.max(self.width_bits), self.count);
        let new_size = HEADER_SIZE + new_payload_len;
        let new_ref = alloc.alloc(new_size)?;
        {
            let bytes = alloc.translate_mut(new_ref, new_size)?;
            bytes[HEADER_SIZE..].fill(0);
        }
        let final_width = needed.max(self.width_bits);
        {
            let bytes = alloc.translate_mut(new_ref, new_size)?;
            let mut dst = 0u32;
            for (src, &v) in old_values.iter().enumerate() {
                if src as u32 == index {
                    pack::write(&mut bytes[HEADER_SIZE..], final_width, dst, value);
                    dst += 1;
                }
                pack::write(&mut bytes[HEADER_SIZE..], final_width, dst, v);
                dst += 1;
            }
            if index == old_count {
                pack::write(&mut bytes[HEADER_SIZE..], final_width, dst, value);
            }
        }
        alloc.free(self.ref_, self.byte_size());
        self.ref_ = new_ref;
        self.width_bits = final_width;
        self.write_header(alloc)?;
        Ok(self.ref_)
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: i64) -> Result<Ref> {
        let count = self.count;
        self.insert(alloc, count, value)
    }

    /// Remove the element at `index`, shifting later elements down.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, index: u32) -> Result<Ref> {
        self.check_index(index)?;
        self.copy_on_write(alloc)?;
        let old_count = self.count;
        let width = self.width_bits;
        let old_values: Vec<i64> = (0..old_count)
            .map(|i| self.get(alloc, i).unwrap_or(0))
            .collect();
        self.count = old_count - 1;
        let new_payload_len = pack::bytes_for(width, self.count);
        let new_size = HEADER_SIZE + new_payload_len;
        let new_ref = alloc.alloc(new_size.max(HEADER_SIZE))?;
        {
            let bytes = alloc.translate_mut(new_ref, new_size.max(HEADER_SIZE))?;
            bytes[HEADER_SIZE..].fill(0);
            let mut dst = 0u32;
            for (src, &v) in old_values.iter().enumerate() {
                if src as u32 == index {
                    continue;
                }
                pack::write(&mut bytes[HEADER_SIZE..], width, dst, v);
                dst += 1;
            }
        }
        alloc.free(self.ref_, self.byte_size());
        self.ref_ = new_ref;
        self.write_header(alloc)?;
        Ok(self.ref_)
    }

    /// Drop every element past `new_count`.
    pub fn truncate(&mut self, alloc: &mut SlabAlloc, new_count: u32) -> Result<Ref> {
        if new_count >= self.count {
            return Ok(self.ref_);
        }
        self.copy_on_write(alloc)?;
        let width = self.width_bits;
        let kept: Vec<i64> = (0..new_count).map(|i| self.get(alloc, i).unwrap_or(0)).collect();
        self.count = new_count;
        let new_payload_len = pack::bytes_for(width, self.count);
        let new_size = HEADER_SIZE + new_payload_len;
        let new_ref = alloc.alloc(new_size.max(HEADER_SIZE))?;
        {
            let bytes = alloc.translate_mut(new_ref, new_size.max(HEADER_SIZE))?;
            bytes[HEADER_SIZE..].fill(0);
            for (i, &v) in kept.iter().enumerate() {
                pack::write(&mut bytes[HEADER_SIZE..], width, i as u32, v);
            }
        }
        alloc.free(self.ref_, self.byte_size());
        self.ref_ = new_ref;
        self.write_header(alloc)?;
        Ok(self.ref_)
    }

    /// Re-read this array's header after its ref changed underneath it --
    /// e.g. after a parent rewrote the child-ref slot this accessor was
    /// created from.
    pub fn update_from_parent(&mut self, alloc: &SlabAlloc, new_ref: Ref) -> Result<()> {
        *self = Self::at(alloc, new_ref)?;
        Ok(())
    }

    pub fn destroy(self, alloc: &mut SlabAlloc) {
        let size = self.byte_size();
        alloc.free(self.ref_, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;

    fn alloc() -> SlabAlloc {
        SlabAlloc::open_buffer(vec![0u8; 24], DatabaseConfig::in_memory())
    }

    #[test]
    fn new_array_is_empty() {
        let mut a = alloc();
        let arr = Array::new(&mut a, false, false).unwrap();
        assert_eq!(arr.count(), 0);
        assert!(arr.is_empty());
    }

    #[test]
    fn add_then_get_round_trips() {
        let mut a = alloc();
        let mut arr = Array::new(&mut a, false, false).unwrap();
        arr.add(&mut a, 10).unwrap();
        arr.add(&mut a, -5).unwrap();
        arr.add(&mut a, 70_000).unwrap();
        assert_eq!(arr.count(), 3);
        assert_eq!(arr.get(&a, 0).unwrap(), 10);
        assert_eq!(arr.get(&a, 1).unwrap(), -5);
        assert_eq!(arr.get(&a, 2).unwrap(), 70_000);
    }

    #[test]
    fn insert_shifts_later_elements() {
        let mut a = alloc();
        let mut arr = Array::new(&mut a, false, false).unwrap();
        arr.add(&mut a, 1).unwrap();
        arr.add(&mut a, 2).unwrap();
        arr.insert(&mut a, 1, 99).unwrap();
        assert_eq!(arr.get(&a, 0).unwrap(), 1);
        assert_eq!(arr.get(&a, 1).unwrap(), 99);
        assert_eq!(arr.get(&a, 2).unwrap(), 2);
    }

    #[test]
    fn erase_shifts_later_elements_down() {
        let mut a = alloc();
        let mut arr = Array::new(&mut a, false, false).unwrap();
        for v in [1, 2, 3] {
            arr.add(&mut a, v).unwrap();
        }
        arr.erase(&mut a, 1).unwrap();
        assert_eq!(arr.count(), 2);
        assert_eq!(arr.get(&a, 0).unwrap(), 1);
        assert_eq!(arr.get(&a, 1).unwrap(), 3);
    }

    #[test]
    fn copy_on_write_relocates_read_only_array() {
        // Hand-build a read-only array (width 8, one element) sitting in
        // the baseline region, as if it had just been read back from a
        // freshly opened file.
        let header_width_code = pack::width_code(8);
        let mut buf = vec![0u8; 24];
        buf.extend_from_slice(&[0, header_width_code, 1, 0, 0, 0, 0, 0]);
        buf.push(1u8);
        let mut a = SlabAlloc::open_buffer(buf, DatabaseConfig::in_memory());
        let old_ref = 24;
        assert!(a.is_read_only(old_ref));

        let mut arr = Array::at(&a, old_ref).unwrap();
        assert_eq!(arr.get(&a, 0).unwrap(), 1);
        arr.add(&mut a, 2).unwrap();
        assert_ne!(arr.ref_(), old_ref);
        assert_eq!(arr.get(&a, 1).unwrap(), 2);
    }

    #[test]
    fn has_refs_array_decodes_inline_and_ref_tags() {
        let mut a = alloc();
        let mut arr = Array::new(&mut a, true, false).unwrap();
        arr.add(&mut a, crate::types::tag_inline(5)).unwrap();
        arr.add(&mut a, 4096).unwrap();
        match arr.get_as_ref(&a, 0).unwrap() {
            crate::types::TaggedValue::Inline(v) => assert_eq!(v, 5),
            _ => panic!("expected inline"),
        }
        match arr.get_as_ref(&a, 1).unwrap() {
            crate::types::TaggedValue::Ref(r) => assert_eq!(r, 4096),
            _ => panic!("expected ref"),
        }
    }
}
