//! Error types for the engine facade

use std::path::PathBuf;
use thiserror::Error;
use topiclog_core::{ConfigError, StreamNameError};
use topiclog_durability::DurabilityError;
use topiclog_storage::{CodecError, StorageError};

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors surfaced to engine callers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Stream was never opened
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// Stream name cannot be stored in the directory
    #[error("invalid stream name: {0}")]
    InvalidStreamName(#[from] StreamNameError),

    /// Every directory slot is taken
    #[error("stream directory is full ({max} streams)")]
    DirectoryFull {
        /// Directory capacity
        max: usize,
    },

    /// No parked read matches the cancel request
    #[error("no parked read at offset {offset} for {size} records with ticket {ticket}")]
    WaiterNotFound {
        /// Requested offset
        offset: u64,
        /// Requested record count
        size: usize,
        /// Ticket of the read
        ticket: u64,
    },

    /// Read was cancelled before it could be served
    #[error("read cancelled")]
    Cancelled,

    /// A batch could not be made durable
    #[error("flush failed after {attempts} attempts: {reason}")]
    FlushFailed {
        /// Write attempts made
        attempts: u32,
        /// Last error seen
        reason: String,
    },

    /// Engine has been closed
    #[error("engine is closed")]
    Closed,

    /// Another process holds the database directory
    #[error("database at '{}' is already in use by another process", path.display())]
    AlreadyOpen {
        /// Database directory
        path: PathBuf,
    },

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Durability layer failure
    #[error("durability error: {0}")]
    Durability(DurabilityError),

    /// Address space failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Record could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Filesystem error outside the address space
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DurabilityError> for EngineError {
    fn from(e: DurabilityError) -> Self {
        match e {
            DurabilityError::FlushFailed { attempts, reason } => {
                EngineError::FlushFailed { attempts, reason }
            }
            DurabilityError::ShuttingDown => EngineError::Closed,
            DurabilityError::Storage(StorageError::Closed) => EngineError::Closed,
            DurabilityError::Storage(e) => EngineError::Storage(e),
            DurabilityError::Codec(e) => EngineError::Codec(e),
            other => EngineError::Durability(other),
        }
    }
}

impl EngineError {
    /// Whether the error came from corrupt data on disk.
    pub fn is_corruption(&self) -> bool {
        match self {
            EngineError::Codec(_) => true,
            EngineError::Durability(e) => e.is_corruption(),
            _ => false,
        }
    }
}
