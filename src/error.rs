//! Error types for the storage engine.
//!
//! Variants follow the error kinds laid out in spec §7. Argument errors are
//! raised eagerly and leave state unchanged; `CapacityExhausted` is mostly
//! surfaced through plain return values at call sites (`Option`/`bool`) and
//! only appears here for paths with no natural sentinel; `CorruptData` and
//! `Io` propagate upward and should be treated as terminal for the
//! instance that raised them.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Out-of-range offset/length, malformed argument, negative count,
    /// even `pair_cap`, `pair_cap` below the minimum, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Write on a read-only instance, mutation while a traversal is open
    /// on the same owner, inflate/deflate on fixed-capacity storage, an
    /// operation on an unallocated page, or a node operation that
    /// violates a structural precondition.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Allocation failed because capacity is full and fixed, or a
    /// safe-resize refused cleanly. Recoverable; most call sites report
    /// this through a return value instead of this variant.
    #[error("capacity exhausted")]
    CapacityExhausted,

    /// A structural invariant was violated: bad flag byte, out-of-range
    /// free-list link, subtree index out of range, codec deserialize
    /// failure, and so on.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// Raised only by `create`; every other cancellation point reports
    /// partial progress through its return value instead.
    #[error("operation cancelled")]
    Cancelled,

    /// Propagated from the backing store. Treat the instance as unusable
    /// for further mutation after this occurs on a mutating path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn corrupt_data(msg: impl Into<String>) -> Self {
        Self::CorruptData(msg.into())
    }
}
