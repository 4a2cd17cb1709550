//! Error types for the durability layer

use thiserror::Error;
use topiclog_storage::{CodecError, HeaderError, StorageError};

/// Result type for durability operations
pub type Result<T> = std::result::Result<T, DurabilityError>;

/// Errors raised while building, flushing, or recovering batches.
#[derive(Debug, Error)]
pub enum DurabilityError {
    /// Address space failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Record could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Header could not be read or written
    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    /// Block lies outside the inode it was looked up in
    #[error("block {block} is outside inode starting at block {start} with {slots} slots")]
    SlotOutOfRange {
        /// Requested logical block
        block: u64,
        /// First block of the inode
        start: u64,
        /// Slot count of the inode
        slots: u32,
    },

    /// On-disk structures are inconsistent
    #[error("corruption: {0}")]
    Corruption(String),

    /// Database was created with a different geometry
    #[error("geometry mismatch: database has {found}, configuration has {expected}")]
    GeometryMismatch {
        /// Configured geometry
        expected: String,
        /// Geometry recorded in the header
        found: String,
    },

    /// A batch could not be made durable
    #[error("flush failed after {attempts} attempts: {reason}")]
    FlushFailed {
        /// Write attempts made
        attempts: u32,
        /// Last error seen
        reason: String,
    },

    /// Pipeline no longer accepts appends
    #[error("flush pipeline is shut down")]
    ShuttingDown,
}

impl DurabilityError {
    /// Create a corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        DurabilityError::Corruption(msg.into())
    }

    /// Whether this error was produced by a corrupt structure on disk.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            DurabilityError::Corruption(_) | DurabilityError::Codec(_)
        )
    }
}
