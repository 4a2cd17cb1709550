//! Engine: the entry point over one database directory
//!
//! ## Opening
//!
//! `Engine::open` takes the directory lock, opens the address space, runs
//! crash recovery, rebuilds every stream from its latest durable inode and
//! starts the flush thread.
//!
//! ## Writing
//!
//! `put` encodes the records under the stream's append lock, which assigns
//! ids and queues the append in one critical section, then blocks until the
//! batch holding them is durable. Writing to an unknown stream creates it.
//!
//! ## Reading
//!
//! `get` returns a [`PendingRead`]. It resolves immediately when enough
//! durable records exist; otherwise the read is parked in the stream's
//! [`TailWaitQueue`] and resolved by the flush thread later.
//!
//! ## Closing
//!
//! `close` flushes everything queued, resolves parked reads with
//! [`EngineError::Closed`] and releases the directory lock. `Drop` calls it.

use crate::error::{EngineError, EngineResult};
use crate::reader::StreamReader;
use crate::registry::{StreamHandle, StreamRegistry};
use crate::waiters::{PendingRead, Reply, TailService, Waiter};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use topiclog_core::{validate_stream_name, EngineConfig, Metrics, MetricsSnapshot, MAX_STREAMS};
use topiclog_durability::{
    recover, DurableView, FlushObserver, FlushPipeline, InodeStore, PendingAppend,
    PipelineConfig, Recovered, RecoveryReport, StreamLog,
};
use topiclog_storage::{AddressSpace, HeaderStore, Record, MAX_RECORD_PAYLOAD, RECORD_FORMAT_VERSION};
use tracing::{debug, error, info};

/// Lock file taken exclusively while a database is open
pub const LOCK_FILE_NAME: &str = ".lock";

/// Point-in-time description of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream name
    pub name: String,

    /// Directory slot
    pub slot: u32,

    /// Bytes covered by committed batches
    pub durable_size: u64,

    /// Offset the next record will get
    pub next_offset: u64,

    /// Reads parked on this stream
    pub parked_reads: usize,
}

/// Persistence engine over one database directory.
pub struct Engine {
    config: EngineConfig,
    space: Arc<AddressSpace>,
    registry: Arc<StreamRegistry>,
    reader: StreamReader,
    tail: Arc<TailService>,
    pipeline: FlushPipeline,
    metrics: Arc<Metrics>,
    recovery: RecoveryReport,
    next_ticket: AtomicU64,
    closed: AtomicBool,
    lock_file: Mutex<Option<File>>,
}

impl Engine {
    /// Open or create the database at `config.base_path`.
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.base_path)?;
        let lock_file = acquire_lock(&config.base_path)?;

        let metrics = Arc::new(Metrics::new());
        let space = Arc::new(AddressSpace::open(
            &config.base_path,
            config.shard_bit,
            Arc::clone(&metrics),
        )?);
        let inodes = Arc::new(InodeStore::new(
            Arc::clone(&space),
            config.geometry,
            Arc::clone(&metrics),
        ));
        let headers = HeaderStore::new(&config.base_path);
        let Recovered { header, report } = recover(&config, &space, &headers, &inodes)?;

        let registry = Arc::new(StreamRegistry::new());
        for (slot, entry) in header.streams() {
            let view = match entry.latest_inode {
                Some(addr) => {
                    let head = inodes.load(addr)?;
                    Some(DurableView {
                        size: head.logical_end(&config.geometry),
                        head,
                        head_addr: addr,
                    })
                }
                None => None,
            };
            registry.insert(StreamLog::new(entry.name.clone(), slot as u32, view));
        }

        let reader = StreamReader::new(Arc::clone(&inodes), Arc::clone(&metrics));
        let tail = Arc::new(TailService::new(
            Arc::clone(&registry),
            reader.clone(),
            Arc::clone(&metrics),
        ));
        let observer: Arc<dyn FlushObserver> = tail.clone();
        let pipeline = FlushPipeline::start(
            PipelineConfig::from_engine_config(&config),
            Arc::clone(&space),
            inodes,
            headers,
            header,
            report.durable_pointer,
            Arc::clone(&metrics),
            observer,
        )?;

        info!(
            target: "topiclog::engine",
            path = %config.base_path.display(),
            streams = registry.len(),
            durable_pointer = report.durable_pointer,
            created = report.created,
            "Engine opened"
        );

        Ok(Engine {
            config,
            space,
            registry,
            reader,
            tail,
            pipeline,
            metrics,
            recovery: report,
            next_ticket: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            lock_file: Mutex::new(Some(lock_file)),
        })
    }

    /// Create the stream if it does not exist yet.
    pub fn open_stream(&self, name: &str) -> EngineResult<()> {
        self.ensure_open()?;
        self.stream(name, true).map(|_| ())
    }

    /// Append `records` to `stream` and wait until they are durable.
    ///
    /// Returns the number of records written. The records get consecutive
    /// offsets; no other append to the same stream interleaves with them.
    pub fn put<P: AsRef<[u8]>>(&self, stream: &str, records: &[P]) -> EngineResult<usize> {
        self.ensure_open()?;
        let handle = self.stream(stream, true)?;
        if records.is_empty() {
            return Ok(0);
        }
        if let Some(big) = records.iter().find(|r| r.as_ref().len() > MAX_RECORD_PAYLOAD) {
            return Err(topiclog_storage::CodecError::PayloadTooLarge(big.as_ref().len()).into());
        }

        let total: usize = records
            .iter()
            .map(|r| Record::encoded_len_for(r.as_ref().len()))
            .sum();
        let (tx, rx) = mpsc::channel();
        {
            let mut next = handle.log.lock_append();
            let first = *next;
            let mut bytes = Vec::with_capacity(total);
            for payload in records {
                let id = first + bytes.len() as u64;
                Record::encode_parts(id, RECORD_FORMAT_VERSION, payload.as_ref(), &mut bytes)?;
            }
            let len = bytes.len() as u64;

            self.pipeline.submit(PendingAppend {
                stream: Arc::clone(&handle.log),
                first_offset: first,
                bytes,
                count: records.len(),
                reply: tx,
            })?;
            *next = first + len;
        }

        Metrics::incr(&self.metrics.appends);
        Metrics::add(&self.metrics.records_appended, records.len() as u64);
        Metrics::add(&self.metrics.bytes_appended, total as u64);

        match rx.recv() {
            Ok(Ok(ack)) => Ok(ack.count),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(EngineError::Closed),
        }
    }

    /// Read `size` records of `stream` starting at `offset`.
    ///
    /// The returned read is already resolved when enough durable records
    /// exist. Otherwise it stays parked until flushes supply the rest.
    pub fn get(&self, stream: &str, offset: u64, size: usize) -> EngineResult<PendingRead> {
        self.ensure_open()?;
        let handle = self.stream(stream, false)?;
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        let pending = PendingRead::new(ticket, offset, size, rx);

        let (records, next_offset) = match handle.log.durable_view() {
            Some(view) if size > 0 => {
                let batch = self.reader.read(&view, offset, size)?;
                (batch.records, batch.next_offset)
            }
            _ => (Vec::new(), offset),
        };

        if records.len() == size {
            let _ = tx.send(Ok(Reply {
                stream: stream.to_string(),
                next_offset,
                records,
            }));
            return Ok(pending);
        }

        let remaining = size - records.len();
        debug!(
            target: "topiclog::engine",
            stream,
            offset,
            next_offset,
            remaining,
            ticket,
            "Parking read"
        );
        self.park_read(
            &handle,
            Waiter {
                ticket,
                request_offset: offset,
                request_size: size,
                next_offset,
                remaining,
                records,
                reply: tx,
            },
        );
        Ok(pending)
    }

    /// Park `waiter`, then catch up with a flush or close that raced it.
    fn park_read(&self, handle: &StreamHandle, waiter: Waiter) {
        let next_offset = waiter.next_offset;
        handle.waiters.park(waiter);
        Metrics::incr(&self.metrics.waiters_parked);

        // close() may have drained this queue before the park
        if self.is_closed() {
            for waiter in handle.waiters.drain() {
                waiter.fail(EngineError::Closed);
            }
            return;
        }

        // A flush may have landed between the read and the park
        if handle.log.durable_size() > next_offset {
            self.tail.service(handle);
        }
    }

    /// Cancel a parked read.
    ///
    /// The read resolves with [`EngineError::Cancelled`]. A read that has
    /// already been served yields `WaiterNotFound`; its reply is still
    /// delivered to the [`PendingRead`].
    pub fn cancel(&self, stream: &str, offset: u64, size: usize, ticket: u64) -> EngineResult<()> {
        let handle = self.stream(stream, false)?;
        match handle.waiters.cancel(offset, size, ticket) {
            Some(waiter) => {
                waiter.fail(EngineError::Cancelled);
                Metrics::incr(&self.metrics.waiters_cancelled);
                debug!(target: "topiclog::engine", stream, offset, size, ticket, "Cancelled read");
                Ok(())
            }
            None => Err(EngineError::WaiterNotFound {
                offset,
                size,
                ticket,
            }),
        }
    }

    /// End the current batching window and wait until it is durable.
    pub fn flush_now(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.pipeline.flush_now().map_err(Into::into)
    }

    /// Stream names in directory order.
    pub fn streams(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Current state of `stream`.
    pub fn stream_info(&self, stream: &str) -> EngineResult<StreamInfo> {
        let handle = self.stream(stream, false)?;
        Ok(StreamInfo {
            name: handle.log.name().to_string(),
            slot: handle.log.slot(),
            durable_size: handle.log.durable_size(),
            next_offset: handle.log.next_offset(),
            parked_reads: handle.waiters.len(),
        })
    }

    /// Physical offset up to which batches are committed.
    pub fn durable_pointer(&self) -> u64 {
        self.pipeline.durable_pointer()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// What recovery found when the engine was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Configuration the engine was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flush, resolve parked reads with `Closed` and release the directory.
    ///
    /// Idempotent.
    pub fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let flushed = self.pipeline.shutdown();
        if let Err(e) = &flushed {
            error!(target: "topiclog::engine", error = %e, "Final flush failed");
        }

        let mut resolved = 0usize;
        for handle in self.registry.handles() {
            for waiter in handle.waiters.drain() {
                waiter.fail(EngineError::Closed);
                resolved += 1;
            }
        }

        self.space.close();
        self.lock_file.lock().take();
        info!(
            target: "topiclog::engine",
            path = %self.config.base_path.display(),
            durable_pointer = self.pipeline.durable_pointer(),
            parked_reads_closed = resolved,
            "Engine closed"
        );
        flushed.map_err(Into::into)
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Handle for `name`, registering the stream when `create` is set.
    fn stream(&self, name: &str, create: bool) -> EngineResult<Arc<StreamHandle>> {
        validate_stream_name(name)?;
        if let Some(handle) = self.registry.get(name) {
            return Ok(handle);
        }
        if !create {
            return Err(EngineError::StreamNotFound(name.to_string()));
        }

        let slot = self
            .pipeline
            .register_stream(name)?
            .ok_or(EngineError::DirectoryFull { max: MAX_STREAMS })?;
        Ok(self.registry.insert(StreamLog::new(name, slot, None)))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(target: "topiclog::engine", error = %e, "Close on drop failed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.config.base_path)
            .field("streams", &self.registry.len())
            .field("durable_pointer", &self.durable_pointer())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Take the exclusive lock on the database directory.
fn acquire_lock(dir: &Path) -> EngineResult<File> {
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(dir.join(LOCK_FILE_NAME))?;
    fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| EngineError::AlreadyOpen {
        path: dir.to_path_buf(),
    })?;
    Ok(lock_file)
}
