//! Stream directory limits
//!
//! The header region carries a fixed-size inode directory, so the number of
//! streams and the length of their names are bounded.

use thiserror::Error;

/// Maximum number of streams a database can hold.
pub const MAX_STREAMS: usize = 256;

/// Maximum stream name length in bytes.
pub const MAX_STREAM_NAME_LEN: usize = 55;

/// Stream name validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamNameError {
    /// Empty names are not allowed
    #[error("stream name is empty")]
    Empty,

    /// Name exceeds the directory entry capacity
    #[error("stream name is {len} bytes, maximum is {max}")]
    TooLong {
        /// Actual length in bytes
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Control characters and NUL are rejected
    #[error("stream name contains a control character")]
    ControlCharacter,
}

/// Validate a stream name against directory limits.
pub fn validate_stream_name(name: &str) -> Result<(), StreamNameError> {
    if name.is_empty() {
        return Err(StreamNameError::Empty);
    }
    if name.len() > MAX_STREAM_NAME_LEN {
        return Err(StreamNameError::TooLong {
            len: name.len(),
            max: MAX_STREAM_NAME_LEN,
        });
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(StreamNameError::ControlCharacter);
    }
    Ok(())
}
