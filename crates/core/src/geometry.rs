//! Database geometry.
//!
//! A stream's logical byte space is cut into fixed-size blocks, and each
//! inode addresses `inode_slots` consecutive blocks. Both values are chosen
//! when a database is created and recorded in its header; reopening with a
//! different geometry is refused.

use crate::config::ConfigError;

/// Block size and inode capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Bytes per logical block.
    pub block_size: u32,
    /// Block slots per inode (N).
    pub inode_slots: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            block_size: 4096,
            inode_slots: 64,
        }
    }
}

impl Geometry {
    /// Smallest accepted block size.
    pub const MIN_BLOCK_SIZE: u32 = 16;

    /// Largest accepted inode capacity.
    pub const MAX_INODE_SLOTS: u32 = 4096;

    /// Create a validated geometry.
    pub fn new(block_size: u32, inode_slots: u32) -> Result<Self, ConfigError> {
        let geometry = Geometry {
            block_size,
            inode_slots,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Validate block size and inode capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size < Self::MIN_BLOCK_SIZE {
            return Err(ConfigError::BlockSizeTooSmall(self.block_size));
        }
        if self.inode_slots < 2 || self.inode_slots > Self::MAX_INODE_SLOTS {
            return Err(ConfigError::InodeSlotsOutOfRange(self.inode_slots));
        }
        Ok(())
    }

    /// Block size as u64.
    pub fn block_len(&self) -> u64 {
        self.block_size as u64
    }

    /// Logical bytes covered by one inode.
    pub fn inode_span(&self) -> u64 {
        self.block_len() * self.inode_slots as u64
    }

    /// Block index containing a logical offset.
    pub fn block_of(&self, offset: u64) -> u64 {
        offset / self.block_len()
    }

    /// Inode sequence number (Start / N) containing a logical block.
    pub fn inode_of_block(&self, block: u64) -> u64 {
        block / self.inode_slots as u64
    }
}
