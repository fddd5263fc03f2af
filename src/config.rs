//! Runtime configuration knobs for opening a database.
//!
//! Shaped after the teacher's `Config`/`SyncMode` pair: a small set of named
//! presets plus a `Default` tuned for interactive use rather than for either
//! extreme of durability or throughput.

/// Whether the allocator backs writable state with the host filesystem or
/// with a caller-supplied in-memory buffer.
///
/// In-memory mode never calls [`crate::commit::GroupWriter::commit`]
/// successfully -- see spec §6, "In-memory buffer interface".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingStore {
    /// The database lives in a file opened read-write (or read-only).
    File,
    /// The database lives entirely in a caller-supplied byte buffer.
    /// `commit()` is rejected in this mode.
    MemoryBuffer,
}

/// Configuration for [`crate::group::Group::open`].
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Where the database's readable bytes come from.
    pub backing_store: BackingStore,
    /// Map the read-only region with `mmap` rather than reading it on demand.
    /// Disabling this is mostly useful for platforms or test harnesses where
    /// mmap behaves surprisingly.
    pub use_mmap: bool,
    /// Minimum size, in bytes, of a freshly allocated slab. Matches spec
    /// §4.1's "1 MiB minimum chunk".
    pub slab_growth_floor: usize,
    /// Soft ceiling on a single slab's size; exceeding it only logs a
    /// warning; it is never enforced as a hard error, since a single very
    /// large allocation request must still succeed.
    pub slab_growth_soft_ceiling: usize,
    /// Extra slack, in bytes, requested by the free-space allocator's
    /// `ensure_rest` mode (spec §4.5 step 4) so the residual free-list entry
    /// doesn't itself change width during a commit.
    pub free_space_ensure_rest_slack: usize,
    /// Number of whole megabytes to extend the file by when free space is
    /// exhausted (spec §4.5, "extend the file by whole megabytes").
    pub file_growth_increment_mb: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backing_store: BackingStore::File,
            use_mmap: true,
            slab_growth_floor: 1024 * 1024,
            slab_growth_soft_ceiling: 256 * 1024 * 1024,
            free_space_ensure_rest_slack: 8,
            file_growth_increment_mb: 1,
        }
    }
}

impl DatabaseConfig {
    /// Tuned for production use: mmap enabled, no unusual slack.
    pub fn production() -> Self {
        Self::default()
    }

    /// Tuned for throughput-sensitive benchmarking: larger slab growth so
    /// long insert runs don't repeatedly reallocate, at the cost of more
    /// address space reserved up front.
    pub fn benchmark() -> Self {
        Self {
            slab_growth_floor: 16 * 1024 * 1024,
            slab_growth_soft_ceiling: 2 * 1024 * 1024 * 1024,
            file_growth_increment_mb: 16,
            ..Self::default()
        }
    }

    /// An in-memory, non-persistent configuration suitable for scratch
    /// databases and unit tests that never call `commit()`.
    pub fn in_memory() -> Self {
        Self {
            backing_store: BackingStore::MemoryBuffer,
            use_mmap: false,
            ..Self::default()
        }
    }
}
