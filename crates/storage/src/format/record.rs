//! Record format.
//!
//! Every record is self-describing so a reader can validate it in place and
//! find the next one after damage.
//!
//! # Record Layout
//!
//! ```text
//! ┌───────────┬────────────┬─────────┬───────────┬────────────┬─────────────────────┐
//! │ Magic (2) │ Length (4) │ Id (8)  │ CRC32 (4) │ Version (1)│ Payload (Length-13) │
//! └───────────┴────────────┴─────────┴───────────┴────────────┴─────────────────────┘
//! ```
//!
//! All integers are little-endian. `Length` covers everything from `Id` to
//! the end of the payload. The CRC32 covers `Id`, `Version` and `Payload`.
//! `Id` is the offset at which the record begins, so a record read from the
//! wrong place is detected even when its checksum is intact.
//!
//! # Resynchronization
//!
//! On a reseekable failure (bad magic, bad length, checksum mismatch) the
//! decoder scans forward for the next occurrence of the first magic byte and
//! retries there. The scan gives up after [`RESYNC_WINDOW`] bytes; every
//! position examined counts toward that one budget, including candidates
//! that looked like a record and turned out not to be.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc32fast::Hasher;

/// Magic bytes opening every record
pub const RECORD_MAGIC: [u8; 2] = [0xC7, 0x5A];

/// Bytes before the payload: magic + length + id + crc + version
pub const RECORD_HEADER_SIZE: usize = 19;

/// Smallest valid length field (id + crc + version)
pub const RECORD_LENGTH_OVERHEAD: u32 = 13;

/// Largest valid length field
pub const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Largest payload a record can carry
pub const MAX_RECORD_PAYLOAD: usize = (MAX_RECORD_LEN - RECORD_LENGTH_OVERHEAD) as usize;

/// Current record format version
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Resync scan budget in bytes
pub const RESYNC_WINDOW: usize = 1 << 20;

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Offset at which the record begins
    pub id: u64,

    /// Format version byte
    pub version: u8,

    /// Record payload
    pub payload: Vec<u8>,
}

/// A record found by [`Record::decode_resync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resynced {
    /// The decoded record
    pub record: Record,

    /// Bytes consumed from the start of the input, skipped bytes included
    pub consumed: usize,

    /// Bytes skipped before the record
    pub skipped: usize,
}

impl Record {
    /// Create a record with the current format version.
    pub fn new(id: u64, payload: Vec<u8>) -> Self {
        Record {
            id,
            version: RECORD_FORMAT_VERSION,
            payload,
        }
    }

    /// Create a record with an explicit version byte.
    pub fn with_version(id: u64, version: u8, payload: Vec<u8>) -> Self {
        Record {
            id,
            version,
            payload,
        }
    }

    /// Encoded size of a record carrying `payload_len` bytes.
    pub fn encoded_len_for(payload_len: usize) -> usize {
        RECORD_HEADER_SIZE + payload_len
    }

    /// Encoded size of this record.
    pub fn encoded_len(&self) -> usize {
        Self::encoded_len_for(self.payload.len())
    }

    /// Serialize the record.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Append the serialized record to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        Self::encode_parts(self.id, self.version, &self.payload, out)
    }

    /// Append a record built from borrowed parts to `out`.
    pub fn encode_parts(
        id: u64,
        version: u8,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        if payload.len() > MAX_RECORD_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }

        let crc = Self::compute_crc(id, version, payload);
        let length = RECORD_LENGTH_OVERHEAD + payload.len() as u32;

        out.reserve(RECORD_HEADER_SIZE + payload.len());
        out.extend_from_slice(&RECORD_MAGIC);
        // Writes into a Vec cannot fail
        let _ = out.write_u32::<LittleEndian>(length);
        let _ = out.write_u64::<LittleEndian>(id);
        let _ = out.write_u32::<LittleEndian>(crc);
        out.push(version);
        out.extend_from_slice(payload);
        Ok(())
    }

    /// Decode one record from the start of `bytes`.
    ///
    /// Returns the record and the number of bytes it occupied. When
    /// `expected_id` is given, a record whose id differs is rejected with
    /// `IdMismatch`. Input that ends mid-record yields `Truncated`.
    pub fn decode(bytes: &[u8], expected_id: Option<u64>) -> Result<(Self, usize), CodecError> {
        if bytes.len() < RECORD_MAGIC.len() {
            return Err(CodecError::Truncated {
                needed: RECORD_HEADER_SIZE,
            });
        }
        if bytes[0..2] != RECORD_MAGIC {
            return Err(CodecError::MagicMismatch {
                found: [bytes[0], bytes[1]],
            });
        }
        if bytes.len() < 6 {
            return Err(CodecError::Truncated {
                needed: RECORD_HEADER_SIZE,
            });
        }

        let length = LittleEndian::read_u32(&bytes[2..6]);
        if !(RECORD_LENGTH_OVERHEAD..=MAX_RECORD_LEN).contains(&length) {
            return Err(CodecError::LengthInvalid(length));
        }

        let total = 6 + length as usize;
        if bytes.len() < total {
            return Err(CodecError::Truncated { needed: total });
        }

        let id = LittleEndian::read_u64(&bytes[6..14]);
        let stored_crc = LittleEndian::read_u32(&bytes[14..18]);
        let version = bytes[18];
        let payload = &bytes[RECORD_HEADER_SIZE..total];

        let computed_crc = Self::compute_crc(id, version, payload);
        if computed_crc != stored_crc {
            return Err(CodecError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        if let Some(expected) = expected_id {
            if expected != id {
                return Err(CodecError::IdMismatch {
                    expected,
                    found: id,
                });
            }
        }

        Ok((
            Record {
                id,
                version,
                payload: payload.to_vec(),
            },
            total,
        ))
    }

    /// Decode the first valid record at or after the start of `bytes`.
    ///
    /// `base` is the offset of `bytes[0]`; when given, a candidate at
    /// position `p` must carry id `base + p`. `end_of_data` tells the decoder
    /// that nothing follows `bytes`: a candidate running past the end is then
    /// a false positive rather than a reason to fetch more input.
    ///
    /// Errors:
    /// - `Truncated { needed }`: `bytes` must be extended to `needed` bytes
    ///   (measured from `bytes[0]`) before a decision can be made.
    /// - `IdMismatch`: the record at position 0 is intact but misplaced.
    /// - `ResyncLimitExceeded`: no record within the scan budget.
    pub fn decode_resync(
        bytes: &[u8],
        base: Option<u64>,
        end_of_data: bool,
    ) -> Result<Resynced, CodecError> {
        let mut pos = 0usize;

        loop {
            let expected = base.map(|b| b + pos as u64);
            match Self::decode(&bytes[pos..], expected) {
                Ok((record, used)) => {
                    return Ok(Resynced {
                        record,
                        consumed: pos + used,
                        skipped: pos,
                    })
                }
                Err(CodecError::Truncated { needed }) => {
                    if !end_of_data {
                        return Err(CodecError::Truncated {
                            needed: pos + needed,
                        });
                    }
                }
                Err(e @ CodecError::IdMismatch { .. }) if pos == 0 => return Err(e),
                Err(CodecError::IdMismatch { .. }) => {}
                Err(e) if e.is_reseekable() => {}
                Err(e) => return Err(e),
            }

            // Scan for the next first-magic byte after the failed position
            let from = pos + 1;
            let next = bytes
                .get(from..)
                .and_then(|rest| rest.iter().position(|&b| b == RECORD_MAGIC[0]));
            match next {
                Some(i) if from + i <= RESYNC_WINDOW => pos = from + i,
                Some(_) => {
                    return Err(CodecError::ResyncLimitExceeded {
                        scanned: RESYNC_WINDOW,
                    })
                }
                None if end_of_data || bytes.len() > RESYNC_WINDOW => {
                    return Err(CodecError::ResyncLimitExceeded {
                        scanned: bytes.len().min(RESYNC_WINDOW),
                    })
                }
                // No candidate left: ask for twice the input so a long
                // corrupt run is rescanned a logarithmic number of times
                None => {
                    let needed = (bytes.len() * 2).max(bytes.len() + RECORD_HEADER_SIZE);
                    return Err(CodecError::Truncated {
                        needed: needed.min(RESYNC_WINDOW + 1),
                    });
                }
            }
        }
    }

    /// CRC32 over id, version and payload.
    fn compute_crc(id: u64, version: u8, payload: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&id.to_le_bytes());
        hasher.update(&[version]);
        hasher.update(payload);
        hasher.finalize()
    }
}

/// Record encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The first two bytes are not the record magic
    #[error("magic mismatch: found {found:02x?}")]
    MagicMismatch {
        /// Bytes found instead of the magic
        found: [u8; 2],
    },

    /// Length field outside `13..=MAX_RECORD_LEN`
    #[error("invalid record length {0}")]
    LengthInvalid(u32),

    /// Checksum verification failed
    #[error("checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the record
        expected: u32,
        /// Checksum computed over the bytes read
        computed: u32,
    },

    /// Intact record at an unexpected position
    #[error("record id mismatch: expected {expected}, found {found}")]
    IdMismatch {
        /// Offset the caller read from
        expected: u64,
        /// Id stored in the record
        found: u64,
    },

    /// Resync found no record within its budget
    #[error("resync gave up after scanning {scanned} bytes")]
    ResyncLimitExceeded {
        /// Bytes examined
        scanned: usize,
    },

    /// Input ends before the record does
    #[error("record truncated: {needed} bytes needed")]
    Truncated {
        /// Bytes needed from the start of the input
        needed: usize,
    },

    /// Payload larger than a record can carry
    #[error("payload of {0} bytes exceeds the record limit")]
    PayloadTooLarge(usize),
}

impl CodecError {
    /// Whether resynchronization may recover from this error.
    pub fn is_reseekable(&self) -> bool {
        matches!(
            self,
            CodecError::MagicMismatch { .. }
                | CodecError::LengthInvalid(_)
                | CodecError::ChecksumMismatch { .. }
        )
    }
}
