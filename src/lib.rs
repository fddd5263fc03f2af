//! # keyspan-core — embedded, file-backed object database storage core
//!
//! `keyspan-core` is the storage layer of an embedded object database: a
//! copy-on-write, memory-mapped file format with crash-safe two-phase
//! commit, a generic dense-index B+tree, a sparse `ObjKey`-keyed row store
//! built on top of it, and a versioned query-descriptor catalog for a sync
//! layer to build on.
//!
//! ## Quick start
//!
//! ```rust
//! use keyspan_core::{Group, DatabaseConfig};
//! use keyspan_core::cluster::{ColumnSpec, ColumnType, ObjKey, Schema, Value};
//!
//! # fn main() -> keyspan_core::Result<()> {
//! let mut group = Group::create(keyspan_core::mem::SlabAlloc::open_buffer(
//!     vec![0u8; 24],
//!     DatabaseConfig::in_memory(),
//! ))?;
//!
//! let schema = Schema {
//!     columns: vec![ColumnSpec { name: "name".into(), col_type: ColumnType::String }],
//! };
//! let table = group.create_table("people", schema)?;
//! group.with_table_mut(table, |alloc, tree| {
//!     tree.insert(alloc, ObjKey(0), &[Value::String("ada".into())])
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Layered bottom-up, each module built only on the ones above it in this
//! list:
//! - **`mem`**: ref-to-pointer translation across a read-only mmap baseline
//!   plus writable in-memory slabs.
//! - **`array`**: packed variable-width integer/ref vectors, the on-disk
//!   node format everything else is built from.
//! - **`btree`**: a generic dense-index B+tree over `array`.
//! - **`cluster`**: a sparse `ObjKey`-keyed row-storage B+tree (column-major
//!   typed cells per leaf) -- one per table.
//! - **`commit`**: the two-phase commit writer that makes a `group`'s edits
//!   durable.
//! - **`group`**: the top-level container -- table catalog and free-list.
//! - **`sync`**: `SubscriptionStore` and `SchemaVersions`, catalogs layered
//!   on ordinary `group` tables.
//!
//! See `DESIGN.md` for how each module's implementation is grounded.

pub mod array;
pub mod btree;
pub mod cluster;
pub mod commit;
pub mod config;
pub mod error;
pub mod group;
pub mod logging;
pub mod mem;
pub mod sync;
pub mod types;

pub use crate::config::DatabaseConfig;
pub use crate::error::{Error, Result};
pub use crate::group::Group;
pub use crate::sync::{SchemaVersions, SubscriptionState, SubscriptionStore};
