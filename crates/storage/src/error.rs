//! Storage error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the chunked address space.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Offset (or offset + length) outside the addressable range
    #[error("invalid offset {offset} for {len} bytes")]
    InvalidOffset {
        /// Requested offset
        offset: u64,
        /// Requested length
        len: usize,
    },

    /// The address space was closed
    #[error("address space is closed")]
    Closed,

    /// A shard file could not be created or opened
    #[error("failed to open shard {shard} at {path}: {source}")]
    ShardOpenFailed {
        /// Shard index
        shard: u64,
        /// Shard file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Read, write or sync failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
