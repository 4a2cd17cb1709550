//! Inode structure and on-disk encoding.
//!
//! An inode maps `N` consecutive logical blocks of one stream, starting at
//! block `start`, to the physical offsets holding them. On disk an inode is
//! a regular codec record whose id is the physical offset it was written at
//! and whose version byte is [`INODE_FORMAT_VERSION`].
//!
//! # Payload Layout
//!
//! ```text
//! ┌──────────────────┬───────────┬──────────┬─────────────────┬─────────────────┐
//! │ Stream slot (4)  │ Start (8) │ Size (8) │ Slots (N x 8)   │ Skips (6 x 8)   │
//! └──────────────────┴───────────┴──────────┴─────────────────┴─────────────────┘
//! ```
//!
//! Empty slots and missing skip pointers are stored as `u64::MAX`.

use crate::error::{DurabilityError, Result};
use byteorder::{ByteOrder, LittleEndian};
use topiclog_core::Geometry;
use topiclog_storage::{Record, RECORD_HEADER_SIZE};

/// Version byte of inode records
pub const INODE_FORMAT_VERSION: u8 = 1;

/// Number of skip pointers (distances 1, 2, 4, 8, 16, 32)
pub const SKIP_LEVELS: usize = 6;

const NONE: u64 = u64::MAX;
const FIXED_PAYLOAD: usize = 4 + 8 + 8;

/// Block map for one fixed-size logical range of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Directory slot of the owning stream
    pub stream_slot: u32,

    /// First logical block covered (a multiple of the slot count)
    pub start: u64,

    /// Bytes written into the covered range
    pub size: u64,

    /// Physical offset of each block
    pub slots: Vec<Option<u64>>,

    /// Physical offsets of predecessors at distance `2^k`
    pub skips: [Option<u64>; SKIP_LEVELS],
}

impl Inode {
    /// Empty inode starting at logical block `start`.
    pub fn empty(stream_slot: u32, start: u64, geometry: &Geometry) -> Self {
        Inode {
            stream_slot,
            start,
            size: 0,
            slots: vec![None; geometry.inode_slots as usize],
            skips: [None; SKIP_LEVELS],
        }
    }

    /// Position of this inode in its stream's chain.
    pub fn seq(&self, geometry: &Geometry) -> u64 {
        self.start / geometry.inode_slots as u64
    }

    /// Logical offset of the first covered byte.
    pub fn logical_start(&self, geometry: &Geometry) -> u64 {
        self.start * geometry.block_len()
    }

    /// Logical offset one past the last written byte.
    pub fn logical_end(&self, geometry: &Geometry) -> u64 {
        self.logical_start(geometry) + self.size
    }

    /// Whether every block is written in full.
    pub fn is_full(&self, geometry: &Geometry) -> bool {
        self.size >= geometry.inode_span()
    }

    /// Slot index of a logical block.
    pub fn slot_for_block(&self, block: u64) -> Result<usize> {
        let slots = self.slots.len() as u64;
        if block < self.start || block >= self.start + slots {
            return Err(DurabilityError::SlotOutOfRange {
                block,
                start: self.start,
                slots: slots as u32,
            });
        }
        Ok((block - self.start) as usize)
    }

    /// Physical offset of a logical block, if it has been written.
    pub fn block_address(&self, block: u64) -> Result<Option<u64>> {
        Ok(self.slots[self.slot_for_block(block)?])
    }

    /// Payload size for a given slot count.
    pub fn payload_len(inode_slots: u32) -> usize {
        FIXED_PAYLOAD + inode_slots as usize * 8 + SKIP_LEVELS * 8
    }

    /// Full record size for a given slot count.
    pub fn encoded_len(inode_slots: u32) -> usize {
        RECORD_HEADER_SIZE + Self::payload_len(inode_slots)
    }

    /// Append the inode record, to be written at physical offset `addr`.
    pub fn encode_into(&self, addr: u64, out: &mut Vec<u8>) -> Result<()> {
        let mut payload = vec![0u8; Self::payload_len(self.slots.len() as u32)];
        LittleEndian::write_u32(&mut payload[0..4], self.stream_slot);
        LittleEndian::write_u64(&mut payload[4..12], self.start);
        LittleEndian::write_u64(&mut payload[12..20], self.size);

        let mut pos = FIXED_PAYLOAD;
        for slot in self.slots.iter().chain(self.skips.iter()) {
            LittleEndian::write_u64(&mut payload[pos..pos + 8], slot.unwrap_or(NONE));
            pos += 8;
        }

        Record::encode_parts(addr, INODE_FORMAT_VERSION, &payload, out)?;
        Ok(())
    }

    /// Decode an inode record expected at physical offset `addr`.
    ///
    /// Returns the inode and the number of bytes its record occupied.
    pub fn decode(bytes: &[u8], addr: u64, geometry: &Geometry) -> Result<(Self, usize)> {
        let (record, used) = Record::decode(bytes, Some(addr))?;
        if record.version != INODE_FORMAT_VERSION {
            return Err(DurabilityError::corruption(format!(
                "inode at {} has version {}",
                addr, record.version
            )));
        }
        Ok((Self::from_payload(&record.payload, addr, geometry)?, used))
    }

    fn from_payload(payload: &[u8], addr: u64, geometry: &Geometry) -> Result<Self> {
        if payload.len() != Self::payload_len(geometry.inode_slots) {
            return Err(DurabilityError::corruption(format!(
                "inode at {} has {} payload bytes, geometry expects {}",
                addr,
                payload.len(),
                Self::payload_len(geometry.inode_slots)
            )));
        }

        let read = |pos: usize| {
            let raw = LittleEndian::read_u64(&payload[pos..pos + 8]);
            (raw != NONE).then_some(raw)
        };

        let n = geometry.inode_slots as usize;
        let slots = (0..n).map(|i| read(FIXED_PAYLOAD + i * 8)).collect();
        let mut skips = [None; SKIP_LEVELS];
        for (k, skip) in skips.iter_mut().enumerate() {
            *skip = read(FIXED_PAYLOAD + (n + k) * 8);
        }

        let inode = Inode {
            stream_slot: LittleEndian::read_u32(&payload[0..4]),
            start: LittleEndian::read_u64(&payload[4..12]),
            size: LittleEndian::read_u64(&payload[12..20]),
            slots,
            skips,
        };
        if inode.size > geometry.inode_span() || inode.start % n as u64 != 0 {
            return Err(DurabilityError::corruption(format!(
                "inode at {} covers an impossible range",
                addr
            )));
        }
        Ok(inode)
    }
}
