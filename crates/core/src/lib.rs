//! Core types for topiclog
//!
//! This crate defines the pieces shared by every layer of the engine:
//! - EngineConfig: recognized engine options and TOML loading
//! - Geometry: block size and inode capacity of a database
//! - Limits: stream directory and naming limits
//! - Metrics: explicit counter context passed into each component

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod geometry;
pub mod limits;
pub mod metrics;

pub use config::{ConfigError, EngineConfig};
pub use geometry::Geometry;
pub use limits::{validate_stream_name, StreamNameError, MAX_STREAMS, MAX_STREAM_NAME_LEN};
pub use metrics::{Metrics, MetricsSnapshot};
