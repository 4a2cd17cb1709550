//! Durability layer for topiclog
//!
//! This crate turns buffered appends into crash-consistent batches:
//!
//! - Inodes: per-stream block maps with skip pointers, tagged addresses and
//!   a generational arena for versions not yet on disk
//! - Flush pipeline: one background thread batching appends across streams
//!   into a single write per epoch
//! - Recovery: locating the last committed batch and rewinding the inode
//!   directory to it

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flush;
pub mod inode;
pub mod recovery;

pub use error::{DurabilityError, Result};
pub use flush::{
    serialize_batch, AppendAck, DurableView, FlushObserver, FlushPipeline, PendingAppend,
    PipelineConfig, SerializedBatch, StreamHead, StreamLog, StreamWrite, FLUSH_RETRY_ALERT,
    FLUSH_RETRY_BACKOFF, SHUTDOWN_FLUSH_ATTEMPTS,
};
pub use inode::{
    Address, BlockRef, Inode, InodeArena, InodeChain, InodeHandle, InodeStore, Located,
    INODE_FORMAT_VERSION, SKIP_LEVELS,
};
pub use recovery::{recover, Recovered, RecoveryReport};
