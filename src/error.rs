//! Crate-wide error type.
//!
//! Mirrors the storage core's error taxonomy: every kind is surfaced to the
//! caller and nothing is retried internally. See spec §7 for the mapping
//! from error kind to the situation that produces it.

use std::io;
use thiserror::Error;

use crate::cluster::ObjKey;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every error the storage core can surface.
#[derive(Debug, Error)]
pub enum Error {
    /// Host I/O failure. Fatal to the in-progress operation; for a commit in
    /// particular, the file is guaranteed to remain at its previous version
    /// because the top-ref is not overwritten until after the payload fsync.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `insert` found the key already present, or `get`/`erase` did not find it.
    #[error("invalid key: {0:?}")]
    InvalidKey(ObjKey),

    /// An index was out of range for the collection being indexed.
    #[error("index {index} out of bounds (size {size})")]
    OutOfBounds {
        /// The offending index.
        index: usize,
        /// The size of the collection at the time of the access.
        size: usize,
    },

    /// An inner node's descent could not find a subtree for a key.
    #[error("key not found during descent: {0:?}")]
    KeyNotFound(ObjKey),

    /// Schema-level misuse: wrong type, wrong nullability, or similar.
    #[error("logic error: {0}")]
    LogicError(String),

    /// A value's runtime type did not match the column's declared type.
    #[error("illegal type: {0}")]
    IllegalType(String),

    /// Two operations or options cannot be combined as requested.
    #[error("illegal combination: {0}")]
    IllegalCombination(String),

    /// A subscription set reached a terminal `Error` state.
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Attempt to drop a table that is still the target of a backlink column.
    #[error("cannot drop table: still targeted by cross-table links ({0})")]
    CrossTableLinkTarget(String),

    /// File signature mismatch or top-ref out of range at open time.
    #[error("invalid database file: {0}")]
    InvalidDatabase(String),
}

impl Error {
    /// True for errors that leave previously-committed state untouched --
    /// i.e. every error this crate can produce, since the commit path never
    /// partially applies (see [`crate::commit::GroupWriter::commit`]).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::InvalidDatabase(_))
    }
}
