//! Flush pipeline
//!
//! Producers queue encoded records; one background thread turns everything
//! queued during an epoch into a single batch write.
//!
//! # Epochs
//!
//! The first append into an empty queue starts the epoch timer. The epoch
//! ends when `flush_interval` elapses, when the queued bytes reach
//! `max_batch_size`, when `flush_now()` is called, or at shutdown.
//!
//! A batch takes appends from the front of the queue up to `max_batch_size`
//! bytes; a single larger append forms a batch of its own. Whatever is left
//! is taken by the following batches without waiting for a new epoch.
//!
//! # Write Path
//!
//! 1. Serialize the batch (data area, tail area, inode area, trailer)
//! 2. `write_at` at the durable pointer, then `sync_range`
//! 3. Persist the header with the new checkpoint and inode directory
//! 4. Advance the durable pointer and publish each stream's durable view
//! 5. Reply to producers, then notify the [`FlushObserver`]
//!
//! Steps 1-3 are retried as a unit with a fixed backoff until they succeed.
//! Only once shutdown has been requested does a batch give up, after
//! [`SHUTDOWN_FLUSH_ATTEMPTS`] attempts.
//!
//! # Thread Lifecycle
//!
//! `shutdown()` stops intake, lets the thread flush whatever is queued, and
//! joins it. `Drop` does the same.

use super::batch::{serialize_batch, SerializedBatch, StreamWrite};
use super::stream::{DurableView, StreamLog};
use crate::error::{DurabilityError, Result};
use crate::inode::{InodeChain, InodeStore};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use topiclog_core::{EngineConfig, Metrics};
use topiclog_storage::{AddressSpace, Header, HeaderStore, StorageError};
use tracing::{debug, error, info, warn};

/// Pause between failed flush attempts
pub const FLUSH_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// A failed flush is logged at `error` every this many attempts
pub const FLUSH_RETRY_ALERT: u32 = 10;

/// Attempts a batch gets once shutdown has been requested
pub const SHUTDOWN_FLUSH_ATTEMPTS: u32 = 3;

/// Called by the flush thread after every committed batch.
pub trait FlushObserver: Send + Sync {
    /// `streams` are the streams the batch extended, in batch order.
    fn on_flush(&self, streams: &[Arc<StreamLog>]);
}

/// Flush pipeline parameters.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Batching window
    pub flush_interval: Duration,

    /// Queued bytes that end an epoch early, and the most one batch takes
    pub max_batch_size: usize,

    /// Pause between failed attempts
    pub retry_backoff: Duration,
}

impl PipelineConfig {
    /// Pipeline parameters from the engine configuration.
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        PipelineConfig {
            flush_interval: config.flush_interval(),
            max_batch_size: config.max_batch_size,
            retry_backoff: FLUSH_RETRY_BACKOFF,
        }
    }
}

/// Acknowledgement sent to a producer once its records are durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendAck {
    /// Id of the first record
    pub first_offset: u64,

    /// Offset following the last record
    pub next_offset: u64,

    /// Records written
    pub count: usize,
}

/// Encoded records waiting for the next batch.
#[derive(Debug)]
pub struct PendingAppend {
    /// Target stream
    pub stream: Arc<StreamLog>,

    /// Id of the first record
    pub first_offset: u64,

    /// Encoded records, contiguous from `first_offset`
    pub bytes: Vec<u8>,

    /// Records in `bytes`
    pub count: usize,

    /// One-shot reply channel
    pub reply: Sender<Result<AppendAck>>,
}

/// Producer queue. Appends are counted from the pipeline start.
#[derive(Default)]
struct Queue {
    pending: VecDeque<PendingAppend>,
    pending_bytes: usize,
    epoch_start: Option<Instant>,
    /// Appends submitted
    submitted: u64,
    /// Appends taken into batches
    taken: u64,
    /// Appends whose batch has finished
    completed: u64,
    /// Every append up to this count must be flushed without waiting
    flush_target: u64,
    shutdown: bool,
    stopped: bool,
}

struct Shared {
    config: PipelineConfig,
    queue: Mutex<Queue>,
    work_ready: Condvar,
    batch_done: Condvar,
    durable: AtomicU64,
    space: Arc<AddressSpace>,
    inodes: Arc<InodeStore>,
    header_store: HeaderStore,
    header: Mutex<Header>,
    metrics: Arc<Metrics>,
    observer: Arc<dyn FlushObserver>,
}

/// Batching flush pipeline with one background thread.
pub struct FlushPipeline {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlushPipeline {
    /// Start the flush thread.
    ///
    /// `header` must be the header as of `durable_pointer`, already
    /// persisted.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: PipelineConfig,
        space: Arc<AddressSpace>,
        inodes: Arc<InodeStore>,
        header_store: HeaderStore,
        header: Header,
        durable_pointer: u64,
        metrics: Arc<Metrics>,
        observer: Arc<dyn FlushObserver>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            config,
            queue: Mutex::new(Queue::default()),
            work_ready: Condvar::new(),
            batch_done: Condvar::new(),
            durable: AtomicU64::new(durable_pointer),
            space,
            inodes,
            header_store,
            header: Mutex::new(header),
            metrics,
            observer,
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            chains: FxHashMap::default(),
        };
        let handle = thread::Builder::new()
            .name("topiclog-flush".to_string())
            .spawn(move || worker.run())
            .map_err(StorageError::from)?;

        Ok(FlushPipeline {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue an append for the current epoch.
    ///
    /// Must be called while holding the stream's append lock, so queue order
    /// matches record id order.
    pub fn submit(&self, append: PendingAppend) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(DurabilityError::ShuttingDown);
        }
        if queue.pending.is_empty() {
            queue.epoch_start = Some(Instant::now());
        }
        queue.pending_bytes += append.bytes.len();
        queue.pending.push_back(append);
        queue.submitted += 1;
        self.shared.work_ready.notify_one();
        Ok(())
    }

    /// End the current epoch and wait until everything queued so far is
    /// durable.
    pub fn flush_now(&self) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        let target = queue.submitted;
        if queue.taken < target {
            queue.flush_target = queue.flush_target.max(target);
            self.shared.work_ready.notify_one();
        }

        while queue.completed < target {
            if queue.stopped {
                return Err(DurabilityError::ShuttingDown);
            }
            self.shared.batch_done.wait(&mut queue);
        }
        Ok(())
    }

    /// Physical offset up to which batches are committed.
    pub fn durable_pointer(&self) -> u64 {
        self.shared.durable.load(Ordering::Acquire)
    }

    /// Register a stream in the inode directory.
    ///
    /// Returns the stream's directory slot, or `None` when the directory is
    /// full. A newly registered stream is persisted before returning.
    pub fn register_stream(&self, name: &str) -> Result<Option<u32>> {
        let mut header = self.shared.header.lock();
        if let Some(slot) = header.find_stream(name) {
            return Ok(Some(slot as u32));
        }
        let mut next = header.clone();
        let Some(slot) = next.register_stream(name) else {
            return Ok(None);
        };
        self.shared.header_store.persist(&next)?;
        *header = next;
        info!(target: "topiclog::flush", stream = name, slot, "Registered stream");
        Ok(Some(slot as u32))
    }

    /// Copy of the current header.
    pub fn header(&self) -> Header {
        self.shared.header.lock().clone()
    }

    /// Whether the flush thread accepts appends.
    pub fn is_running(&self) -> bool {
        let queue = self.shared.queue.lock();
        !queue.shutdown && !queue.stopped
    }

    /// Stop intake, flush everything queued, and join the flush thread.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            self.shared.work_ready.notify_all();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!(target: "topiclog::flush", "Flush thread panicked");
                return Err(DurabilityError::FlushFailed {
                    attempts: 0,
                    reason: "flush thread panicked".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Drop for FlushPipeline {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for FlushPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushPipeline")
            .field("durable_pointer", &self.durable_pointer())
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Appends of one stream within a batch, coalesced in arrival order.
struct StreamGroup {
    stream: Arc<StreamLog>,
    data: Vec<u8>,
}

/// Marks the pipeline stopped even if the flush thread unwinds.
struct StopGuard(Arc<Shared>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        let mut queue = self.0.queue.lock();
        queue.stopped = true;
        queue.shutdown = true;
        self.0.batch_done.notify_all();
    }
}

/// State owned by the flush thread.
struct Worker {
    shared: Arc<Shared>,
    chains: FxHashMap<u32, InodeChain>,
}

impl Worker {
    fn run(mut self) {
        let _guard = StopGuard(Arc::clone(&self.shared));
        info!(target: "topiclog::flush", "Flush thread started");

        while let Some(batch) = self.next_batch() {
            let appends = batch.len() as u64;
            self.flush(batch);
            let mut queue = self.shared.queue.lock();
            queue.completed += appends;
            self.shared.batch_done.notify_all();
        }

        info!(target: "topiclog::flush", "Flush thread stopped");
    }

    /// Block until an epoch ends and take up to `max_batch_size` bytes of
    /// its appends.
    fn next_batch(&self) -> Option<Vec<PendingAppend>> {
        let config = &self.shared.config;
        let mut queue = self.shared.queue.lock();
        loop {
            if queue.pending.is_empty() {
                if queue.shutdown {
                    return None;
                }
                self.shared.work_ready.wait(&mut queue);
                continue;
            }

            let elapsed = queue
                .epoch_start
                .map(|start| start.elapsed())
                .unwrap_or_default();
            if queue.shutdown
                || queue.taken < queue.flush_target
                || queue.pending_bytes >= config.max_batch_size
                || elapsed >= config.flush_interval
            {
                break;
            }
            let remaining = config.flush_interval - elapsed;
            self.shared.work_ready.wait_for(&mut queue, remaining);
        }

        let mut bytes = 0usize;
        let mut count = 0usize;
        for append in queue.pending.iter() {
            if count > 0 && bytes + append.bytes.len() > config.max_batch_size {
                break;
            }
            bytes += append.bytes.len();
            count += 1;
        }

        let batch: Vec<PendingAppend> = queue.pending.drain(..count).collect();
        queue.pending_bytes -= bytes;
        queue.taken += count as u64;
        // Leftovers keep the epoch they arrived in
        if queue.pending.is_empty() {
            queue.epoch_start = None;
        }
        Some(batch)
    }

    fn flush(&mut self, batch: Vec<PendingAppend>) {
        let groups = group_by_stream(&batch);
        let base = self.shared.durable.load(Ordering::Acquire);
        let chains: Vec<InodeChain> = groups
            .iter()
            .map(|g| self.take_chain(&g.stream))
            .collect();

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            match self.try_flush(base, &groups, &chains) {
                Ok(done) => break Ok(done),
                Err(e) => {
                    Metrics::incr(&self.shared.metrics.flush_retries);
                    warn!(
                        target: "topiclog::flush",
                        base,
                        attempt = attempts,
                        error = %e,
                        "Batch flush failed, retrying"
                    );
                    if attempts % FLUSH_RETRY_ALERT == 0 {
                        error!(
                            target: "topiclog::flush",
                            base,
                            attempts,
                            error = %e,
                            "Batch still not durable, writers are stalled"
                        );
                    }
                    if self.shared.queue.lock().shutdown && attempts >= SHUTDOWN_FLUSH_ATTEMPTS {
                        break Err(e.to_string());
                    }
                    thread::sleep(self.shared.config.retry_backoff);
                }
            }
        };

        match outcome {
            Ok((chains, serialized)) => {
                for chain in chains {
                    self.chains.insert(chain.stream_slot(), chain);
                }
                self.complete(batch, &groups, serialized);
            }
            Err(reason) => {
                for chain in chains {
                    self.chains.insert(chain.stream_slot(), chain);
                }
                error!(
                    target: "topiclog::flush",
                    base,
                    attempts,
                    appends = batch.len(),
                    "Giving up on batch during shutdown"
                );
                for append in batch {
                    let _ = append.reply.send(Err(DurabilityError::FlushFailed {
                        attempts,
                        reason: reason.clone(),
                    }));
                }
            }
        }
    }

    /// Serialize, write, sync and commit one batch.
    ///
    /// Works on copies of `chains`, so a failed attempt leaves them intact
    /// and the retry produces identical bytes.
    fn try_flush(
        &self,
        base: u64,
        groups: &[StreamGroup],
        chains: &[InodeChain],
    ) -> Result<(Vec<InodeChain>, SerializedBatch)> {
        let mut writes: Vec<StreamWrite<'_>> = chains
            .iter()
            .zip(groups)
            .map(|(chain, group)| StreamWrite {
                chain: chain.clone(),
                data: &group.data,
            })
            .collect();
        let database_uuid = self.shared.header.lock().database_uuid;
        let batch = serialize_batch(base, &database_uuid, &mut writes)?;

        let space = &self.shared.space;
        space.write_at(&batch.bytes, base)?;
        space.sync_range(base, batch.bytes.len() as u64)?;

        {
            let mut header = self.shared.header.lock();
            let mut next = header.clone();
            next.checkpoint = batch.end();
            next.flush_seq += 1;
            for head in &batch.heads {
                if let Some(Some(entry)) = next.directory.get_mut(head.stream_slot as usize) {
                    entry.latest_inode = Some(head.addr);
                }
            }
            self.shared.header_store.persist(&next)?;
            *header = next;
        }

        Ok((writes.into_iter().map(|w| w.chain).collect(), batch))
    }

    fn complete(&self, batch: Vec<PendingAppend>, groups: &[StreamGroup], serialized: SerializedBatch) {
        let end = serialized.end();
        let len = serialized.bytes.len() as u64;
        self.shared.durable.store(end, Ordering::Release);
        Metrics::incr(&self.shared.metrics.flushes);
        Metrics::add(&self.shared.metrics.bytes_flushed, len);

        for (group, head) in groups.iter().zip(&serialized.heads) {
            group.stream.publish(DurableView {
                head: Arc::clone(&head.inode),
                head_addr: head.addr,
                size: head.size,
            });
        }

        debug!(
            target: "topiclog::flush",
            base = serialized.trailer.batch_start,
            len,
            streams = groups.len(),
            appends = batch.len(),
            inodes = serialized.trailer.inode_count,
            "Batch flushed"
        );

        for append in batch {
            let ack = AppendAck {
                first_offset: append.first_offset,
                next_offset: append.first_offset + append.bytes.len() as u64,
                count: append.count,
            };
            let _ = append.reply.send(Ok(ack));
        }

        let streams: Vec<Arc<StreamLog>> = groups.iter().map(|g| Arc::clone(&g.stream)).collect();
        self.shared.observer.on_flush(&streams);
    }

    /// The stream's chain, created from its durable view on first use.
    fn take_chain(&mut self, stream: &Arc<StreamLog>) -> InodeChain {
        if let Some(chain) = self.chains.remove(&stream.slot()) {
            return chain;
        }
        let inodes = Arc::clone(&self.shared.inodes);
        match stream.durable_view() {
            Some(view) => InodeChain::resume(stream.slot(), inodes, view.head_addr, view.head),
            None => InodeChain::new(stream.slot(), inodes),
        }
    }
}

fn group_by_stream(batch: &[PendingAppend]) -> Vec<StreamGroup> {
    let mut index: FxHashMap<u32, usize> = FxHashMap::default();
    let mut groups: Vec<StreamGroup> = Vec::new();
    for append in batch {
        let i = *index.entry(append.stream.slot()).or_insert_with(|| {
            groups.push(StreamGroup {
                stream: Arc::clone(&append.stream),
                data: Vec::new(),
            });
            groups.len() - 1
        });
        groups[i].data.extend_from_slice(&append.bytes);
    }
    groups
}
