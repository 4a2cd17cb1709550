//! Tail-wait queue
//!
//! A read that reaches the durable end of a stream before collecting all of
//! its records is parked as a [`Waiter`]. Waiters hold the records read so
//! far and the reply channel of the caller's [`PendingRead`].
//!
//! Each stream keeps its waiters ordered by the next offset they need.
//! After every batch the flush thread takes the waiters whose next offset
//! is now below the durable size, in offset order, and retries them. A
//! retry that is still short goes back into the queue.

use crate::error::{EngineError, EngineResult};
use crate::reader::StreamReader;
use crate::registry::{StreamHandle, StreamRegistry};
use parking_lot::Mutex;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use topiclog_core::Metrics;
use topiclog_durability::{FlushObserver, StreamLog};
use topiclog_storage::Record;
use tracing::{debug, warn};

/// Records returned to a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Stream the records belong to
    pub stream: String,

    /// Offset following the last record
    pub next_offset: u64,

    /// Records in offset order
    pub records: Vec<Record>,
}

/// A read that may still be waiting for data.
///
/// The ticket together with the request's offset and size identifies the
/// read for [`Engine::cancel`](crate::Engine::cancel).
#[derive(Debug)]
pub struct PendingRead {
    ticket: u64,
    offset: u64,
    size: usize,
    rx: Receiver<EngineResult<Reply>>,
}

impl PendingRead {
    pub(crate) fn new(
        ticket: u64,
        offset: u64,
        size: usize,
        rx: Receiver<EngineResult<Reply>>,
    ) -> Self {
        PendingRead {
            ticket,
            offset,
            size,
            rx,
        }
    }

    /// Ticket identifying this read.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Requested offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested record count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Block until the read resolves.
    pub fn wait(self) -> EngineResult<Reply> {
        self.rx.recv().unwrap_or(Err(EngineError::Closed))
    }

    /// Block for at most `timeout`; `None` if the read is still parked.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<EngineResult<Reply>> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => Some(reply),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(EngineError::Closed)),
        }
    }

    /// The result if the read has already resolved.
    pub fn try_take(&self) -> Option<EngineResult<Reply>> {
        match self.rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(EngineError::Closed)),
        }
    }
}

/// A parked read.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub ticket: u64,
    pub request_offset: u64,
    pub request_size: usize,
    /// Offset of the first missing record
    pub next_offset: u64,
    pub remaining: usize,
    pub records: Vec<Record>,
    pub reply: Sender<EngineResult<Reply>>,
}

impl Waiter {
    fn matches(&self, offset: u64, size: usize, ticket: u64) -> bool {
        self.request_offset == offset && self.request_size == size && self.ticket == ticket
    }

    pub fn resolve(self, stream: &str) {
        let reply = Reply {
            stream: stream.to_string(),
            next_offset: self.next_offset,
            records: self.records,
        };
        // The reader may have dropped its PendingRead
        let _ = self.reply.send(Ok(reply));
    }

    pub fn fail(self, error: EngineError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Parked reads of one stream, ordered by next offset.
#[derive(Debug, Default)]
pub struct TailWaitQueue {
    waiters: Mutex<Vec<Waiter>>,
}

impl TailWaitQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parked reads.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether no read is parked.
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Next offsets of the parked reads, front first.
    pub fn offsets(&self) -> Vec<u64> {
        self.waiters.lock().iter().map(|w| w.next_offset).collect()
    }

    /// Insert after every waiter with the same or a lower offset.
    pub(crate) fn park(&self, waiter: Waiter) {
        let mut waiters = self.waiters.lock();
        let at = waiters.partition_point(|w| w.next_offset <= waiter.next_offset);
        waiters.insert(at, waiter);
    }

    /// Remove the waiter for exactly this request.
    pub(crate) fn cancel(&self, offset: u64, size: usize, ticket: u64) -> Option<Waiter> {
        let mut waiters = self.waiters.lock();
        let at = waiters.iter().position(|w| w.matches(offset, size, ticket))?;
        Some(waiters.remove(at))
    }

    /// Remove the front waiters that need data below `durable_size`.
    pub(crate) fn take_ready(&self, durable_size: u64) -> Vec<Waiter> {
        let mut waiters = self.waiters.lock();
        let ready = waiters.partition_point(|w| w.next_offset < durable_size);
        waiters.drain(..ready).collect()
    }

    /// Remove every waiter.
    pub(crate) fn drain(&self) -> Vec<Waiter> {
        std::mem::take(&mut *self.waiters.lock())
    }
}

/// Retries parked reads after each flush.
pub(crate) struct TailService {
    registry: Arc<StreamRegistry>,
    reader: StreamReader,
    metrics: Arc<Metrics>,
}

impl TailService {
    pub fn new(registry: Arc<StreamRegistry>, reader: StreamReader, metrics: Arc<Metrics>) -> Self {
        TailService {
            registry,
            reader,
            metrics,
        }
    }

    /// Retry every waiter of `handle` that new durable data can serve.
    pub fn service(&self, handle: &StreamHandle) {
        let durable_size = handle.log.durable_size();
        let ready = handle.waiters.take_ready(durable_size);
        if ready.is_empty() {
            return;
        }
        debug!(
            target: "topiclog::waiters",
            stream = handle.log.name(),
            durable_size,
            waiters = ready.len(),
            "Servicing parked reads"
        );
        for waiter in ready {
            self.retry(handle, waiter);
        }
    }

    fn retry(&self, handle: &StreamHandle, mut waiter: Waiter) {
        let Some(view) = handle.log.durable_view() else {
            handle.waiters.park(waiter);
            return;
        };

        match self.reader.read(&view, waiter.next_offset, waiter.remaining) {
            Ok(batch) => {
                waiter.remaining -= batch.records.len();
                waiter.records.extend(batch.records);
                waiter.next_offset = batch.next_offset;
                if waiter.remaining == 0 {
                    Metrics::incr(&self.metrics.waiters_serviced);
                    waiter.resolve(handle.log.name());
                } else {
                    handle.waiters.park(waiter);
                }
            }
            Err(e) => {
                warn!(
                    target: "topiclog::waiters",
                    stream = handle.log.name(),
                    offset = waiter.next_offset,
                    error = %e,
                    "Parked read failed"
                );
                waiter.fail(e);
            }
        }
    }
}

impl FlushObserver for TailService {
    fn on_flush(&self, streams: &[Arc<StreamLog>]) {
        for stream in streams {
            if let Some(handle) = self.registry.by_slot(stream.slot()) {
                self.service(&handle);
            }
        }
    }
}
