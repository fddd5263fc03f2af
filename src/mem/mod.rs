//! Component A: `SlabAlloc`, the ref-to-bytes translation layer.
//!
//! Every ref below `baseline` lives in the memory-mapped, read-only file
//! region; every ref at or above `baseline` lives in a heap-allocated,
//! writable "slab". Translation is total -- see spec §3 invariants. This
//! module owns the database file handle: raw positional writes and
//! `fsync`/file-growth live here because they're the allocator's job to
//! serve to the commit writer (component E), the same way the teacher's
//! `Pager` owns its `File` and serves page reads/writes to `GraphDB`.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{trace, warn};

use crate::config::{BackingStore, DatabaseConfig};
use crate::error::{Error, Result};
use crate::types::{Ref, NULL_REF};

mod slab;
pub use slab::Slab;

/// Header region reserved at the front of every file: 8-byte top-ref
/// followed by a 16-byte signature (spec §6). Refs are never smaller than
/// this, so ref `0` is unambiguous as the "absent" sentinel.
pub const HEADER_SIZE: u64 = 24;

/// Round `n` up to the nearest multiple of 8.
#[inline]
pub(crate) fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Translates refs to bytes and hands out fresh writable refs.
pub struct SlabAlloc {
    file: Option<File>,
    path: Option<PathBuf>,
    mmap: Option<Mmap>,
    /// In-memory-only backing buffer, used when there is no file.
    memory_image: Vec<u8>,
    /// File length (or memory-image length) at the time the read region was
    /// last established. Refs below this are read-only.
    baseline: u64,
    slabs: Vec<Slab>,
    config: DatabaseConfig,
    /// True when this allocator was opened strictly for reading (spec
    /// §4.7: "a read-only opener ... does not migrate"). Distinct from
    /// [`BackingStore::MemoryBuffer`], which is a different reason commits
    /// are refused.
    read_only: bool,
}

impl SlabAlloc {
    /// Open (creating if necessary) a file-backed allocator for read-write
    /// access.
    pub fn open_file(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        Self::open_file_with_mode(path, config, false)
    }

    /// Open an existing file strictly for reading. The file is never
    /// created, never grown, and [`Self::can_persist`] always reports
    /// `false` -- a `Group` opened this way never runs the legacy metadata
    /// migration in spec §4.7, it only observes whatever schema form is
    /// already on disk.
    pub fn open_file_read_only(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        Self::open_file_with_mode(path, config, true)
    }

    fn open_file_with_mode(path: impl AsRef<Path>, config: DatabaseConfig, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let mmap = if config.use_mmap && file_len > 0 {
            // Safety is delegated entirely to `memmap2`: this crate never
            // dereferences raw pointers itself, only the byte slices the
            // mapping exposes, which is why `unsafe` is confined to this one
            // call in the whole crate.
            unsafe { Mmap::map(&file).ok() }
        } else {
            None
        };

        Ok(Self {
            file: Some(file),
            path: Some(path),
            mmap,
            memory_image: Vec::new(),
            baseline: file_len,
            slabs: Vec::new(),
            config,
            read_only,
        })
    }

    /// Open an allocator backed by a caller-supplied in-memory buffer.
    /// `commit()` on the owning [`crate::group::Group`] is rejected in this
    /// mode (spec §6).
    pub fn open_buffer(initial: Vec<u8>, config: DatabaseConfig) -> Self {
        let baseline = initial.len() as u64;
        Self {
            file: None,
            path: None,
            mmap: None,
            memory_image: initial,
            baseline,
            slabs: Vec::new(),
            config,
            read_only: false,
        }
    }

    /// True when this allocator can commit to durable storage.
    pub fn can_persist(&self) -> bool {
        matches!(self.config.backing_store, BackingStore::File) && self.file.is_some() && !self.read_only
    }

    /// True when this allocator was opened strictly for reading (spec §4.7).
    pub fn is_write_mode(&self) -> bool {
        !self.read_only
    }

    /// The path backing this allocator, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Refs below this value are read-only (resolve into the mapped file or
    /// memory image); refs at or above it resolve into a slab.
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Length of the readable region -- identical to `baseline()`, exposed
    /// under the name the free-space algorithm (component F) uses.
    pub fn file_len(&self) -> u64 {
        self.baseline
    }

    /// True iff `r` falls in the read-only region.
    #[inline]
    pub fn is_read_only(&self, r: Ref) -> bool {
        r != NULL_REF && r < self.baseline
    }

    fn read_only_region(&self) -> &[u8] {
        if let Some(mmap) = &self.mmap {
            &mmap[..]
        } else {
            &self.memory_image[..]
        }
    }

    /// Resolve `r` to an immutable byte slice of at least `len` bytes.
    pub fn translate(&self, r: Ref, len: usize) -> Result<&[u8]> {
        if r == NULL_REF {
            return Err(Error::LogicError("translate of null ref".into()));
        }
        if r < self.baseline {
            let region = self.read_only_region();
            let start = r as usize;
            let end = start
                .checked_add(len)
                .filter(|&end| end <= region.len())
                .ok_or_else(|| {
                    Error::InvalidDatabase(format!("ref {r} + {len} exceeds file bounds"))
                })?;
            Ok(&region[start..end])
        } else {
            let slab = self.slab_containing(r)?;
            slab.read(r, len)
        }
    }

    /// Resolve `r` to a mutable byte slice. Fails if `r` is read-only --
    /// callers must route through copy-on-write first (see [`crate::array`]).
    pub fn translate_mut(&mut self, r: Ref, len: usize) -> Result<&mut [u8]> {
        if self.is_read_only(r) {
            return Err(Error::LogicError(format!(
                "attempt to mutate read-only ref {r}"
            )));
        }
        let slab = self.slab_containing_mut(r)?;
        slab.read_mut(r, len)
    }

    fn slab_containing(&self, r: Ref) -> Result<&Slab> {
        // O(log slabs): slabs are maintained in ascending `start` order.
        let idx = self
            .slabs
            .binary_search_by(|slab| slab.compare_contains(r))
            .map_err(|_| Error::InvalidDatabase(format!("ref {r} not within any slab")))?;
        Ok(&self.slabs[idx])
    }

    fn slab_containing_mut(&mut self, r: Ref) -> Result<&mut Slab> {
        let idx = self
            .slabs
            .binary_search_by(|slab| slab.compare_contains(r))
            .map_err(|_| Error::InvalidDatabase(format!("ref {r} not within any slab")))?;
        Ok(&mut self.slabs[idx])
    }

    /// Allocate a fresh writable region of at least `size` bytes.
    ///
    /// Every allocation is rounded up to an 8-byte multiple so every ref
    /// this allocator ever hands out is itself 8-byte aligned (spec §6,
    /// "pages are 8-byte aligned"). `has_refs` arrays rely on this: the
    /// tagged-inline-vs-child-ref distinction in [`crate::types::untag`]
    /// only works if a genuine child ref's low bit is always 0.
    pub fn alloc(&mut self, size: usize) -> Result<Ref> {
        let size = align8(size);
        for slab in self.slabs.iter_mut() {
            if let Some(r) = slab.try_alloc(size) {
                return Ok(r);
            }
        }
        self.grow_and_alloc(size)
    }

    fn grow_and_alloc(&mut self, size: usize) -> Result<Ref> {
        let start = self
            .slabs
            .last()
            .map(|s| s.end())
            .unwrap_or(self.baseline);
        let chunk = size
            .max(self.config.slab_growth_floor)
            .next_power_of_two();
        if chunk > self.config.slab_growth_soft_ceiling {
            warn!(
                requested = size,
                chunk, "slab growth exceeds configured soft ceiling"
            );
        }
        trace!(start, chunk, "allocating new slab");
        let mut slab = Slab::new(start, chunk);
        let r = slab
            .try_alloc(size)
            .ok_or_else(|| Error::LogicError("freshly grown slab rejected its own allocation".into()))?;
        self.slabs.push(slab);
        Ok(r)
    }

    /// Grow an existing allocation in place when possible, otherwise
    /// allocate fresh and copy the old bytes forward.
    pub fn realloc(&mut self, old_ref: Ref, old_size: usize, new_size: usize) -> Result<Ref> {
        if new_size <= old_size {
            return Ok(old_ref);
        }
        if !self.is_read_only(old_ref) {
            if let Ok(slab) = self.slab_containing_mut(old_ref) {
                if slab.try_grow_in_place(old_ref, old_size, new_size) {
                    return Ok(old_ref);
                }
            }
        }
        let new_ref = self.alloc(new_size)?;
        let old_bytes = self.translate(old_ref, old_size)?.to_vec();
        let dst = self.translate_mut(new_ref, old_size)?;
        dst.copy_from_slice(&old_bytes);
        self.free(old_ref, old_size);
        Ok(new_ref)
    }

    /// Release `r`. A no-op for read-only refs -- those are reclaimed only
    /// by the commit writer's free-list bookkeeping (component E/F).
    pub fn free(&mut self, r: Ref, size: usize) {
        if self.is_read_only(r) || r == NULL_REF {
            return;
        }
        if let Ok(slab) = self.slab_containing_mut(r) {
            slab.free(r, size);
        }
    }

    /// Step 8 of commit (spec §4.5): every slab is now unreachable because
    /// its contents were copied into the file at `new_file_len`. Drop all
    /// slabs and advance the read-only baseline, remapping the growth.
    pub fn free_all(&mut self, new_file_len: u64) -> Result<()> {
        self.slabs.clear();
        self.baseline = new_file_len;
        self.remap()
    }

    fn remap(&mut self) -> Result<()> {
        if !self.config.use_mmap {
            return Ok(());
        }
        if let Some(file) = &self.file {
            if self.baseline > 0 {
                self.mmap = unsafe { Mmap::map(file).ok() };
            } else {
                self.mmap = None;
            }
        }
        Ok(())
    }

    /// Read `len` bytes at an absolute file offset, bypassing the
    /// baseline/slab distinction -- used for the fixed file header.
    pub fn read_raw(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let region = self.read_only_region();
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= region.len())
            .ok_or_else(|| Error::InvalidDatabase("header read out of bounds".into()))?;
        Ok(region[start..end].to_vec())
    }

    /// Write `bytes` at an absolute file offset and update the tracked file
    /// length if the write extended it. Used by the commit writer for
    /// payload writes and by [`Self::publish_top_ref`] for the header.
    pub fn write_raw(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(bytes)?;
                Ok(())
            }
            None => {
                let end = offset as usize + bytes.len();
                if end > self.memory_image.len() {
                    self.memory_image.resize(end, 0);
                }
                self.memory_image[offset as usize..end].copy_from_slice(bytes);
                Ok(())
            }
        }
    }

    /// Extend the file by whole megabytes until it is at least `min_len`
    /// bytes long, per spec §4.5's free-space growth algorithm. The final
    /// byte is materialized with a single write so sparse-file semantics
    /// don't leave the allocation unreadable on filesystems that care.
    pub fn extend_to(&mut self, min_len: u64) -> Result<u64> {
        let mb = 1024 * 1024;
        let increment = self.config.file_growth_increment_mb * mb;
        let mut new_len = self.file_len_on_disk()?;
        if new_len == 0 {
            new_len = HEADER_SIZE;
        }
        while new_len < min_len {
            new_len += increment.max(mb);
        }
        self.write_raw(new_len - 1, &[0u8])?;
        Ok(new_len)
    }

    fn file_len_on_disk(&self) -> Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(self.memory_image.len() as u64),
        }
    }

    /// Current on-disk (or in-memory-buffer) length, the basis the
    /// free-space allocator (component F) extends from -- distinct from
    /// [`Self::baseline`], which only advances when [`Self::free_all`] runs
    /// at the end of a commit, not on every intra-commit growth.
    pub(crate) fn file_len_for_extend(&self) -> u64 {
        self.file_len_on_disk().unwrap_or(self.baseline)
    }

    /// Sum of every live slab's backing allocation, in bytes -- the space
    /// a commit's [`Self::free_all`] is about to reclaim. Used only to
    /// populate `CommitStats::free_bytes_reclaimed` (component E).
    pub(crate) fn live_slab_bytes(&self) -> u64 {
        self.slabs.iter().map(|s| s.capacity() as u64).sum()
    }

    /// `fsync` (or `fdatasync`-equivalent) the backing file. A no-op in
    /// memory-buffer mode.
    pub fn sync_data(&mut self) -> Result<()> {
        if let Some(file) = &self.file {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Overwrite the 8-byte top-ref field and fsync again, per spec §4.5
    /// step 7. This is the single instant at which a commit takes effect.
    pub fn publish_top_ref(&mut self, top_ref: Ref) -> Result<()> {
        self.sync_data()?;
        self.write_raw(0, &top_ref.to_le_bytes())?;
        self.sync_data()?;
        Ok(())
    }

    /// Read the current top-ref straight from the header.
    pub fn read_top_ref(&self) -> Result<Ref> {
        let bytes = self.read_raw(0, 8)?;
        Ok(Ref::from_le_bytes(bytes.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_in_memory() -> SlabAlloc {
        SlabAlloc::open_buffer(vec![0u8; HEADER_SIZE as usize], DatabaseConfig::in_memory())
    }

    #[test]
    fn fresh_allocations_are_writable_and_round_trip() {
        let mut alloc = alloc_in_memory();
        let r = alloc.alloc(16).unwrap();
        assert!(!alloc.is_read_only(r));
        alloc.translate_mut(r, 16).unwrap().copy_from_slice(&[7u8; 16]);
        assert_eq!(alloc.translate(r, 16).unwrap(), &[7u8; 16]);
    }

    #[test]
    fn ref_below_baseline_is_read_only() {
        let alloc = alloc_in_memory();
        assert!(alloc.is_read_only(HEADER_SIZE));
        assert!(!alloc.is_read_only(HEADER_SIZE + 10_000_000));
    }

    #[test]
    fn realloc_grows_and_preserves_contents() {
        let mut alloc = alloc_in_memory();
        let r = alloc.alloc(8).unwrap();
        alloc.translate_mut(r, 8).unwrap().copy_from_slice(&[1; 8]);
        let grown = alloc.realloc(r, 8, 64).unwrap();
        assert_eq!(&alloc.translate(grown, 8).unwrap()[..8], &[1; 8]);
    }

    #[test]
    fn free_all_resets_baseline_and_drops_slabs() {
        let mut alloc = alloc_in_memory();
        let _ = alloc.alloc(32).unwrap();
        assert!(!alloc.slabs.is_empty());
        alloc.free_all(4096).unwrap();
        assert!(alloc.slabs.is_empty());
        assert_eq!(alloc.baseline(), 4096);
    }

    #[test]
    fn translate_out_of_range_is_an_error() {
        let alloc = alloc_in_memory();
        assert!(alloc.translate(HEADER_SIZE + 1_000_000_000, 8).is_err());
    }
}
