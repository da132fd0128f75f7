//! Error types for the storage engine.

use crate::types::PageId;
use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine
///
/// Absent keys and duplicate inserts are ordinary return values
/// (`Option` / `bool`), not errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A page read targeted an id that was never allocated
    #[error("Page {0} is beyond the allocation watermark")]
    PageOutOfRange(PageId),

    /// Buffer pool has no available frames: every frame is pinned
    #[error("Buffer pool exhausted: no available frames")]
    PoolExhausted,

    /// Reached a state the tree invariants rule out; the tree may be corrupt
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl StorageError {
    /// Create an invariant violation error with a message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
