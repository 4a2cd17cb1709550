//! Engine facade for topiclog
//!
//! This crate ties the lower layers together:
//! - Engine: open/close, put, get and cancel over named streams
//! - StreamReader: decoding durable records through a stream's inode chain
//! - Tail-wait queue: reads parked on offsets that are not durable yet,
//!   serviced by the flush thread
//!
//! The engine is the only component that knows about stream names, waiters
//! and the lock on the database directory.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod reader;
mod registry;
pub mod waiters;

pub use engine::{Engine, StreamInfo, LOCK_FILE_NAME};
pub use error::{EngineError, EngineResult};
pub use reader::{ReadBatch, StreamReader, READ_CHUNK};
pub use waiters::{PendingRead, Reply, TailWaitQueue};
