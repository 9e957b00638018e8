//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the store.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current store size.
        size: u64,
    },

    /// A journal frame in the middle of the store failed verification.
    #[error("journal corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Offset of the bad frame.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// Another process holds the store open.
    #[error("storage at {path} is locked by another process")]
    ExclusiveAccess {
        /// Path of the locked file.
        path: String,
    },

    /// Truncation was asked to grow the store.
    #[error("cannot truncate to {requested} bytes, store holds {size}")]
    InvalidTruncate {
        /// Requested size.
        requested: u64,
        /// Current size.
        size: u64,
    },
}
