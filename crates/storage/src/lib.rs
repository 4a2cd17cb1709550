//! Storage layer for topiclog
//!
//! This crate handles the raw bytes on disk:
//! - AddressSpace: one unbounded read_at/write_at surface over fixed-size
//!   shard files, with a reference-counted handle cache
//! - Record codec: magic/length/id/crc framed records with resynchronization
//! - Batch trailer: the EOF marker closing every flushed batch
//! - Header: durable checkpoint and fixed-size inode directory

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod format;
pub mod shard;

pub use error::StorageError;
pub use format::{
    BatchTrailer, CodecError, DirectoryEntry, Header, HeaderError, HeaderStore, Record, Resynced,
    HEADER_FILE_NAME, MAX_RECORD_LEN, MAX_RECORD_PAYLOAD, RECORD_FORMAT_VERSION,
    RECORD_HEADER_SIZE, RECORD_MAGIC, RESYNC_WINDOW, TRAILER_MAGIC, TRAILER_SIZE,
};
pub use shard::{shard_file_name, AddressSpace, SHARD_SLOTS};
