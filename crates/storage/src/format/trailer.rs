//! Batch trailer (EOF marker).
//!
//! Every flushed batch ends with a trailer so recovery can tell a fully
//! written batch from a torn one by scanning backward from the end.
//!
//! # Batch Layout
//!
//! ```text
//! ┌──────────────────────┬───────────────┬───────────────┬───────────────┐
//! │ Data area            │ Tail area     │ Inode area    │ Trailer (32)  │
//! │ (full blocks)        │ (sub-block    │ (inode        │               │
//! │                      │  remainders)  │  records)     │               │
//! └──────────────────────┴───────────────┴───────────────┴───────────────┘
//! ```
//!
//! # Trailer Layout
//!
//! ```text
//! ┌───────────┬─────────────────┬─────────────────────┬─────────────────┬───────────┐
//! │ Magic (8) │ Batch start (8) │ Inode area start (8)│ Inode count (4) │ CRC32 (4) │
//! └───────────┴─────────────────┴─────────────────────┴─────────────────┴───────────┘
//! ```
//!
//! The CRC32 covers the database uuid followed by the first 28 bytes. The
//! uuid itself is not stored, so a trailer only verifies in the database
//! that wrote it and a record payload shaped like a trailer does not.

use byteorder::{ByteOrder, LittleEndian};

/// Magic bytes opening a batch trailer: "TLOG-EOF"
pub const TRAILER_MAGIC: [u8; 8] = *b"TLOG-EOF";

/// Size of a serialized trailer
pub const TRAILER_SIZE: usize = 32;

/// Trailer closing one flushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTrailer {
    /// Physical offset of the first byte of the batch
    pub batch_start: u64,

    /// Physical offset of the first inode record in the batch
    pub inode_area_start: u64,

    /// Number of inode records in the inode area
    pub inode_count: u32,
}

impl BatchTrailer {
    /// Serialize the trailer for the database `database_uuid`.
    pub fn to_bytes(&self, database_uuid: &[u8; 16]) -> [u8; TRAILER_SIZE] {
        let mut bytes = [0u8; TRAILER_SIZE];
        bytes[0..8].copy_from_slice(&TRAILER_MAGIC);
        LittleEndian::write_u64(&mut bytes[8..16], self.batch_start);
        LittleEndian::write_u64(&mut bytes[16..24], self.inode_area_start);
        LittleEndian::write_u32(&mut bytes[24..28], self.inode_count);
        let crc = checksum(database_uuid, &bytes[0..28]);
        LittleEndian::write_u32(&mut bytes[28..32], crc);
        bytes
    }

    /// Parse a trailer from exactly `TRAILER_SIZE` bytes.
    ///
    /// Returns `None` when the magic or checksum does not match.
    pub fn from_bytes(bytes: &[u8], database_uuid: &[u8; 16]) -> Option<Self> {
        if bytes.len() != TRAILER_SIZE || bytes[0..8] != TRAILER_MAGIC {
            return None;
        }
        let stored = LittleEndian::read_u32(&bytes[28..32]);
        if checksum(database_uuid, &bytes[0..28]) != stored {
            return None;
        }
        Some(BatchTrailer {
            batch_start: LittleEndian::read_u64(&bytes[8..16]),
            inode_area_start: LittleEndian::read_u64(&bytes[16..24]),
            inode_count: LittleEndian::read_u32(&bytes[24..28]),
        })
    }

    /// Parse a trailer that ends at physical offset `end`.
    ///
    /// Besides magic and checksum, the recorded offsets must be consistent
    /// with the trailer's own position.
    pub fn parse_at(bytes: &[u8], end: u64, database_uuid: &[u8; 16]) -> Option<Self> {
        let trailer = Self::from_bytes(bytes, database_uuid)?;
        let trailer_start = end.checked_sub(TRAILER_SIZE as u64)?;
        if trailer.batch_start <= trailer.inode_area_start
            && trailer.inode_area_start <= trailer_start
        {
            Some(trailer)
        } else {
            None
        }
    }

    /// Find the last trailer fully contained in `window`.
    ///
    /// `window_start` is the physical offset of `window[0]`. Returns the
    /// physical end offset of the trailer along with the trailer.
    pub fn find_last(
        window: &[u8],
        window_start: u64,
        database_uuid: &[u8; 16],
    ) -> Option<(u64, Self)> {
        if window.len() < TRAILER_SIZE {
            return None;
        }
        (0..=window.len() - TRAILER_SIZE).rev().find_map(|i| {
            if window[i] != TRAILER_MAGIC[0] {
                return None;
            }
            let end = window_start + (i + TRAILER_SIZE) as u64;
            Self::parse_at(&window[i..i + TRAILER_SIZE], end, database_uuid).map(|t| (end, t))
        })
    }

    /// Bytes of the batch, trailer included.
    pub fn batch_len(&self, end: u64) -> u64 {
        end - self.batch_start
    }
}

fn checksum(database_uuid: &[u8; 16], fields: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(database_uuid);
    hasher.update(fields);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: [u8; 16] = [0x5A; 16];

    fn trailer() -> BatchTrailer {
        BatchTrailer {
            batch_start: 4096,
            inode_area_start: 8000,
            inode_count: 3,
        }
    }

    #[test]
    fn test_trailer_roundtrip() {
        let bytes = trailer().to_bytes(&UUID);
        assert_eq!(&bytes[0..8], &TRAILER_MAGIC);
        assert_eq!(BatchTrailer::from_bytes(&bytes, &UUID), Some(trailer()));
    }

    #[test]
    fn test_trailer_rejects_corruption() {
        let mut bytes = trailer().to_bytes(&UUID);
        bytes[12] ^= 1;
        assert_eq!(BatchTrailer::from_bytes(&bytes, &UUID), None);

        let mut bytes = trailer().to_bytes(&UUID);
        bytes[0] = b'X';
        assert_eq!(BatchTrailer::from_bytes(&bytes, &UUID), None);
    }

    #[test]
    fn test_trailer_belongs_to_one_database() {
        let bytes = trailer().to_bytes(&UUID);
        assert_eq!(BatchTrailer::from_bytes(&bytes, &[0x5B; 16]), None);
        assert_eq!(BatchTrailer::find_last(&bytes, 0, &[0u8; 16]), None);
    }

    #[test]
    fn test_parse_at_checks_position() {
        let bytes = trailer().to_bytes(&UUID);
        assert!(BatchTrailer::parse_at(&bytes, 8000 + 32, &UUID).is_some());
        // Inode area cannot start after the trailer itself
        assert!(BatchTrailer::parse_at(&bytes, 8000 + 31, &UUID).is_none());
    }

    #[test]
    fn test_find_last() {
        let first = BatchTrailer {
            batch_start: 0,
            inode_area_start: 10,
            inode_count: 1,
        };
        let second = BatchTrailer {
            batch_start: 42,
            inode_area_start: 60,
            inode_count: 1,
        };

        let mut window = vec![0u8; 10];
        window.extend_from_slice(&first.to_bytes(&UUID));
        window.extend_from_slice(&[0xAB; 28]);
        window.extend_from_slice(&second.to_bytes(&UUID));
        window.extend_from_slice(&[0xCD; 5]);

        assert_eq!(
            BatchTrailer::find_last(&window, 0, &UUID),
            Some((102, second))
        );
        assert_eq!(
            BatchTrailer::find_last(&window[..90], 0, &UUID),
            Some((42, first))
        );
        assert_eq!(BatchTrailer::find_last(&window[..20], 0, &UUID), None);
    }
}
