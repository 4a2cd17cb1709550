//! Engine configuration.
//!
//! Four options are recognized: `shard_bit`, `flush_interval_ms`,
//! `max_batch_size` and `base_path`. They can be set through the builder
//! methods or loaded from a TOML file:
//!
//! ```toml
//! base_path = "/var/lib/topiclog"
//! # Each shard file holds 2^shard_bit bytes of the address space
//! shard_bit = 30
//! # Batching window of the flush pipeline
//! flush_interval_ms = 10
//! # A batch is flushed early once it holds this many bytes
//! max_batch_size = 4194304
//! ```

use crate::geometry::Geometry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_shard_bit() -> u32 {
    30
}

fn default_flush_interval_ms() -> u64 {
    10
}

fn default_max_batch_size() -> usize {
    4 * 1024 * 1024
}

/// Engine configuration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Storage root holding the header and shard files.
    pub base_path: PathBuf,

    /// Shard file size is `2^shard_bit` bytes (default: 30, 1GB).
    #[serde(default = "default_shard_bit")]
    pub shard_bit: u32,

    /// Batching window in milliseconds (default: 10).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Bytes per flush before the window is cut short (default: 4MB).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Block and inode geometry used when creating a database.
    #[serde(skip)]
    pub geometry: Geometry,
}

impl EngineConfig {
    /// Smallest accepted shard bit (4-byte shards).
    pub const MIN_SHARD_BIT: u32 = 2;

    /// Largest accepted shard bit (1TB shards).
    pub const MAX_SHARD_BIT: u32 = 40;

    /// Create a configuration with default values rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            base_path: base_path.into(),
            shard_bit: default_shard_bit(),
            flush_interval_ms: default_flush_interval_ms(),
            max_batch_size: default_max_batch_size(),
            geometry: Geometry::default(),
        }
    }

    /// Set the shard bit (builder pattern).
    pub fn with_shard_bit(mut self, bit: u32) -> Self {
        self.shard_bit = bit;
        self
    }

    /// Set the batching window (builder pattern).
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the batch size threshold (builder pattern).
    pub fn with_max_batch_size(mut self, bytes: usize) -> Self {
        self.max_batch_size = bytes;
        self
    }

    /// Set the database geometry (builder pattern).
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Batching window as a `Duration`.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Shard file size in bytes.
    pub fn shard_size(&self) -> u64 {
        1u64 << self.shard_bit
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyBasePath);
        }
        if !(Self::MIN_SHARD_BIT..=Self::MAX_SHARD_BIT).contains(&self.shard_bit) {
            return Err(ConfigError::ShardBitOutOfRange(self.shard_bit));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::ZeroFlushInterval);
        }
        if self.max_batch_size < 1024 {
            return Err(ConfigError::BatchSizeTooSmall(self.max_batch_size));
        }
        self.geometry.validate()
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Create a configuration optimized for testing.
    ///
    /// Small shards force boundary-spanning writes, and the short window
    /// keeps tests fast.
    pub fn for_testing(base_path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            base_path: base_path.into(),
            shard_bit: 16,
            flush_interval_ms: 2,
            max_batch_size: 256 * 1024,
            geometry: Geometry::default(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No storage root given.
    #[error("base_path must not be empty")]
    EmptyBasePath,

    /// Shard bit outside the supported range.
    #[error("shard_bit {0} is outside 2..=40")]
    ShardBitOutOfRange(u32),

    /// Batching window of zero.
    #[error("flush_interval_ms must be greater than zero")]
    ZeroFlushInterval,

    /// Batch threshold below 1KB.
    #[error("max_batch_size {0} is below the 1KB minimum")]
    BatchSizeTooSmall(usize),

    /// Block size below the minimum.
    #[error("block size {0} is below the 16 byte minimum")]
    BlockSizeTooSmall(u32),

    /// Inode capacity outside the supported range.
    #[error("inode slot count {0} is outside 2..=4096")]
    InodeSlotsOutOfRange(u32),

    /// The configuration file could not be read.
    #[error("failed to read config {path}: {detail}")]
    Read {
        /// Config file path
        path: PathBuf,
        /// Underlying error text
        detail: String,
    },

    /// The configuration text is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(String),
}
