//! On-disk byte formats for records, batch trailers, and the header.
//!
//! This module centralizes all serialization logic for persistent storage.
//! Keeping serialization separate from operational logic (how batches are
//! assembled and flushed) makes format evolution easier to manage.
//!
//! # Module Structure
//!
//! - `record`: length-prefixed checksummed record format and resync
//! - `trailer`: batch EOF marker
//! - `header`: header file with durable checkpoint and inode directory

pub mod header;
pub mod record;
pub mod trailer;

pub use header::{
    DirectoryEntry, Header, HeaderError, HeaderStore, HEADER_FILE_NAME, HEADER_FORMAT_VERSION,
    HEADER_MAGIC, HEADER_SIZE,
};
pub use record::{
    CodecError, Record, Resynced, MAX_RECORD_LEN, MAX_RECORD_PAYLOAD, RECORD_FORMAT_VERSION,
    RECORD_HEADER_SIZE, RECORD_MAGIC, RESYNC_WINDOW,
};
pub use trailer::{BatchTrailer, TRAILER_MAGIC, TRAILER_SIZE};
