//! Error types for quiver-ann operations.
//!
//! Every public operation returns [`Result`]; no failure leaves an index in
//! a partially mutated state observable through the public API.

use std::io;
use thiserror::Error;

/// Result type alias using [`QuiverError`].
pub type Result<T> = std::result::Result<T, QuiverError>;

/// Errors that can occur during quiver-ann operations.
#[derive(Error, Debug)]
pub enum QuiverError {
    /// Invalid parameter value provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Vector dimensions do not match the expected dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected vector dimension.
        expected: usize,
        /// Actual vector dimension provided.
        actual: usize,
    },

    /// Allocation failed while growing a store.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory {
        /// Bytes requested by the failed allocation.
        requested: usize,
    },

    /// Snapshot or serialized data is malformed.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// Checksum verification failed during file loading.
    #[error("checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    /// Attempted operation on an index that has not been built.
    #[error("index not built: insert vectors or run a builder before searching")]
    NotBuilt,

    /// Build aborted via cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation detected; the affected call failed but the graph
    /// remains usable.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl QuiverError {
    /// Creates a new `InvalidArgument` error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Creates a new `DimensionMismatch` error.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Creates a new `OutOfMemory` error.
    pub fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }

    /// Creates a new `CorruptData` error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptData(msg.into())
    }

    /// Creates a new `Internal` error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
