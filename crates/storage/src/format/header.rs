//! Header region format.
//!
//! The header lives in its own file next to the shard files and holds
//! everything needed to reopen a database: its geometry, the durable
//! checkpoint, and the fixed-size inode directory mapping each stream to
//! its latest on-disk inode.
//!
//! # Format
//!
//! ```text
//! +----------------------+
//! | Magic: "TLOG"        | 4 bytes
//! | Format Version       | 4 bytes (u32 LE)
//! | Database UUID        | 16 bytes
//! | Block Size           | 4 bytes (u32 LE)
//! | Inode Slots          | 4 bytes (u32 LE)
//! | Shard Bit            | 4 bytes (u32 LE)
//! | Durable Checkpoint   | 8 bytes (u64 LE)
//! | Flush Sequence       | 8 bytes (u64 LE)
//! | Directory            | MAX_STREAMS x 64 bytes
//! | CRC32                | 4 bytes
//! +----------------------+
//!
//! Directory entry (64 bytes):
//! | Name Length (1) | Name (55, zero padded) | Latest Inode (8, u64::MAX = none) |
//! ```
//!
//! An entry with name length zero is unused.

use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use topiclog_core::{Geometry, MAX_STREAMS, MAX_STREAM_NAME_LEN};

/// Header file name inside the storage root
pub const HEADER_FILE_NAME: &str = "HEADER";

/// Header magic bytes: "TLOG"
pub const HEADER_MAGIC: [u8; 4] = *b"TLOG";

/// Current header format version
pub const HEADER_FORMAT_VERSION: u32 = 1;

const FIXED_SIZE: usize = 52;
const ENTRY_SIZE: usize = 64;
const NO_INODE: u64 = u64::MAX;

/// Serialized header size
pub const HEADER_SIZE: usize = FIXED_SIZE + MAX_STREAMS * ENTRY_SIZE + 4;

/// One stream in the inode directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Stream name
    pub name: String,

    /// Physical address of the stream's latest inode, if it has one
    pub latest_inode: Option<u64>,
}

/// Decoded header region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Format version for forward compatibility
    pub format_version: u32,

    /// Unique database identifier (generated on creation)
    pub database_uuid: [u8; 16],

    /// Block and inode geometry
    pub geometry: Geometry,

    /// Shard bit the shard files were written with
    pub shard_bit: u32,

    /// Physical offset up to which all batches are committed
    pub checkpoint: u64,

    /// Number of batches committed
    pub flush_seq: u64,

    /// Inode directory, indexed by stream slot
    pub directory: Vec<Option<DirectoryEntry>>,
}

impl Header {
    /// Create a header for a fresh database.
    pub fn new(geometry: Geometry, shard_bit: u32) -> Self {
        Header {
            format_version: HEADER_FORMAT_VERSION,
            database_uuid: *uuid::Uuid::new_v4().as_bytes(),
            geometry,
            shard_bit,
            checkpoint: 0,
            flush_seq: 0,
            directory: vec![None; MAX_STREAMS],
        }
    }

    /// Slot of the stream named `name`.
    pub fn find_stream(&self, name: &str) -> Option<usize> {
        self.directory
            .iter()
            .position(|e| e.as_ref().map_or(false, |e| e.name == name))
    }

    /// Assign the first free slot to `name`.
    ///
    /// Returns the existing slot if the stream is already registered, or
    /// `None` when the directory is full.
    pub fn register_stream(&mut self, name: &str) -> Option<usize> {
        if let Some(slot) = self.find_stream(name) {
            return Some(slot);
        }
        let slot = self.directory.iter().position(|e| e.is_none())?;
        self.directory[slot] = Some(DirectoryEntry {
            name: name.to_string(),
            latest_inode: None,
        });
        Some(slot)
    }

    /// Registered streams with their slots.
    pub fn streams(&self) -> impl Iterator<Item = (usize, &DirectoryEntry)> {
        self.directory
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|e| (slot, e)))
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&HEADER_MAGIC);
        LittleEndian::write_u32(&mut bytes[4..8], self.format_version);
        bytes[8..24].copy_from_slice(&self.database_uuid);
        LittleEndian::write_u32(&mut bytes[24..28], self.geometry.block_size);
        LittleEndian::write_u32(&mut bytes[28..32], self.geometry.inode_slots);
        LittleEndian::write_u32(&mut bytes[32..36], self.shard_bit);
        LittleEndian::write_u64(&mut bytes[36..44], self.checkpoint);
        LittleEndian::write_u64(&mut bytes[44..52], self.flush_seq);

        for (slot, entry) in self.directory.iter().enumerate().take(MAX_STREAMS) {
            let start = FIXED_SIZE + slot * ENTRY_SIZE;
            let raw = &mut bytes[start..start + ENTRY_SIZE];
            if let Some(entry) = entry {
                let name = entry.name.as_bytes();
                raw[0] = name.len() as u8;
                raw[1..1 + name.len()].copy_from_slice(name);
                LittleEndian::write_u64(&mut raw[56..64], entry.latest_inode.unwrap_or(NO_INODE));
            }
        }

        let crc_at = HEADER_SIZE - 4;
        let crc = crc32fast::hash(&bytes[..crc_at]);
        LittleEndian::write_u32(&mut bytes[crc_at..], crc);
        bytes
    }

    /// Deserialize the header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() != HEADER_SIZE {
            return Err(HeaderError::Truncated { len: bytes.len() });
        }
        if bytes[0..4] != HEADER_MAGIC {
            return Err(HeaderError::InvalidMagic);
        }

        let crc_at = HEADER_SIZE - 4;
        let stored = LittleEndian::read_u32(&bytes[crc_at..]);
        let computed = crc32fast::hash(&bytes[..crc_at]);
        if stored != computed {
            return Err(HeaderError::ChecksumMismatch {
                expected: stored,
                computed,
            });
        }

        let format_version = LittleEndian::read_u32(&bytes[4..8]);
        if format_version != HEADER_FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(format_version));
        }

        let geometry = Geometry {
            block_size: LittleEndian::read_u32(&bytes[24..28]),
            inode_slots: LittleEndian::read_u32(&bytes[28..32]),
        };
        geometry
            .validate()
            .map_err(|e| HeaderError::InvalidGeometry(e.to_string()))?;

        let mut database_uuid = [0u8; 16];
        database_uuid.copy_from_slice(&bytes[8..24]);

        let mut directory = Vec::with_capacity(MAX_STREAMS);
        for slot in 0..MAX_STREAMS {
            let start = FIXED_SIZE + slot * ENTRY_SIZE;
            let raw = &bytes[start..start + ENTRY_SIZE];
            let name_len = raw[0] as usize;
            if name_len == 0 {
                directory.push(None);
                continue;
            }
            if name_len > MAX_STREAM_NAME_LEN {
                return Err(HeaderError::InvalidEntry { slot });
            }
            let name = std::str::from_utf8(&raw[1..1 + name_len])
                .map_err(|_| HeaderError::InvalidEntry { slot })?
                .to_string();
            let latest = LittleEndian::read_u64(&raw[56..64]);
            directory.push(Some(DirectoryEntry {
                name,
                latest_inode: (latest != NO_INODE).then_some(latest),
            }));
        }

        Ok(Header {
            format_version,
            database_uuid,
            geometry,
            shard_bit: LittleEndian::read_u32(&bytes[32..36]),
            checkpoint: LittleEndian::read_u64(&bytes[36..44]),
            flush_seq: LittleEndian::read_u64(&bytes[44..52]),
            directory,
        })
    }
}

/// Loads and atomically persists the header file.
///
/// Persistence uses the write-fsync-rename pattern, so a crash leaves
/// either the old or the new header in place, never a torn one.
#[derive(Debug, Clone)]
pub struct HeaderStore {
    path: PathBuf,
}

impl HeaderStore {
    /// Header store for the storage root `dir`.
    pub fn new(dir: &Path) -> Self {
        HeaderStore {
            path: dir.join(HEADER_FILE_NAME),
        }
    }

    /// Header file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a header has been written.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read and validate the header.
    pub fn load(&self) -> Result<Header, HeaderError> {
        let bytes = std::fs::read(&self.path)?;
        Header::from_bytes(&bytes)
    }

    /// Persist the header atomically (write-fsync-rename).
    pub fn persist(&self, header: &Header) -> Result<(), HeaderError> {
        let temp_path = self.path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if parent.exists() {
                let dir = File::open(parent)?;
                dir.sync_all()?;
            }
        }
        Ok(())
    }
}

/// Header errors.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header does not start with "TLOG"
    #[error("invalid header magic")]
    InvalidMagic,

    /// Header written by an unknown format version
    #[error("unsupported header version {0}")]
    UnsupportedVersion(u32),

    /// Checksum verification failed
    #[error("header checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Stored checksum
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Header file has the wrong size
    #[error("header is {len} bytes, expected {HEADER_SIZE}")]
    Truncated {
        /// Actual size
        len: usize,
    },

    /// Directory entry cannot be decoded
    #[error("invalid directory entry in slot {slot}")]
    InvalidEntry {
        /// Directory slot
        slot: usize,
    },

    /// Recorded geometry is invalid
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}
