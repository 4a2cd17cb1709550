//! Batching flush pipeline.
//!
//! - `stream`: per-stream append lock and durable view
//! - `batch`: two-pass batch serialization
//! - `pipeline`: epoch batching, the flush thread and retry policy

pub mod batch;
pub mod pipeline;
pub mod stream;

pub use batch::{serialize_batch, SerializedBatch, StreamHead, StreamWrite};
pub use pipeline::{
    AppendAck, FlushObserver, FlushPipeline, PendingAppend, PipelineConfig, FLUSH_RETRY_ALERT,
    FLUSH_RETRY_BACKOFF, SHUTDOWN_FLUSH_ATTEMPTS,
};
pub use stream::{DurableView, StreamLog};
