//! topiclog - persistence engine for a lightweight message-log broker
//!
//! Each named stream is an unbounded, append-only sequence of checksummed
//! records addressed by byte offset. Producers append; consumers read by
//! offset and may wait for records that are not durable yet.
//!
//! # Quick Start
//!
//! ```ignore
//! use topiclog::{Engine, EngineConfig};
//!
//! let engine = Engine::open(EngineConfig::new("/var/lib/topiclog"))?;
//! engine.put("orders", &[b"first".as_slice(), b"second".as_slice()])?;
//!
//! let reply = engine.get("orders", 0, 2)?.wait()?;
//! assert_eq!(reply.records.len(), 2);
//! ```
//!
//! # Architecture
//!
//! - `topiclog-storage`: shard files, record codec, batch trailer, header
//! - `topiclog-durability`: inode chains, the flush pipeline, recovery
//! - `topiclog-engine`: the [`Engine`] facade, reads and the tail-wait queue
//!
//! Only the engine surface is re-exported here.

pub use topiclog_core::{
    ConfigError, EngineConfig, Geometry, MetricsSnapshot, StreamNameError, MAX_STREAMS,
    MAX_STREAM_NAME_LEN,
};
pub use topiclog_durability::RecoveryReport;
pub use topiclog_engine::{
    Engine, EngineError, EngineResult, PendingRead, Reply, StreamInfo, LOCK_FILE_NAME,
};
pub use topiclog_storage::{Record, MAX_RECORD_PAYLOAD, RECORD_HEADER_SIZE};
