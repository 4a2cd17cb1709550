//! Engine counters
//!
//! Every component receives an `Arc<Metrics>` at construction instead of
//! reaching for a process-wide singleton, so tests observe isolated counts.
//! Counters are cumulative and never reset.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative engine counters.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Put calls accepted
    pub appends: AtomicU64,
    /// Records accepted by put
    pub records_appended: AtomicU64,
    /// Encoded record bytes accepted by put
    pub bytes_appended: AtomicU64,
    /// Batches written
    pub flushes: AtomicU64,
    /// Bytes written by flushes (data, tails, inodes and trailers)
    pub bytes_flushed: AtomicU64,
    /// Failed flush write attempts that were retried
    pub flush_retries: AtomicU64,
    /// Shard files opened
    pub shard_opens: AtomicU64,
    /// Inodes loaded from disk on cache miss
    pub inode_loads: AtomicU64,
    /// Reads that had to resynchronize past corrupt bytes
    pub resyncs: AtomicU64,
    /// Bytes skipped while resynchronizing
    pub resync_skipped_bytes: AtomicU64,
    /// Reads parked as waiters
    pub waiters_parked: AtomicU64,
    /// Waiters resolved by a flush
    pub waiters_serviced: AtomicU64,
    /// Waiters removed by cancel
    pub waiters_cancelled: AtomicU64,
}

impl Metrics {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to a counter.
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Increment a counter by one.
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            appends: load(&self.appends),
            records_appended: load(&self.records_appended),
            bytes_appended: load(&self.bytes_appended),
            flushes: load(&self.flushes),
            bytes_flushed: load(&self.bytes_flushed),
            flush_retries: load(&self.flush_retries),
            shard_opens: load(&self.shard_opens),
            inode_loads: load(&self.inode_loads),
            resyncs: load(&self.resyncs),
            resync_skipped_bytes: load(&self.resync_skipped_bytes),
            waiters_parked: load(&self.waiters_parked),
            waiters_serviced: load(&self.waiters_serviced),
            waiters_cancelled: load(&self.waiters_cancelled),
        }
    }
}

/// Plain copy of [`Metrics`] at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Put calls accepted
    pub appends: u64,
    /// Records accepted by put
    pub records_appended: u64,
    /// Encoded record bytes accepted by put
    pub bytes_appended: u64,
    /// Batches written
    pub flushes: u64,
    /// Bytes written by flushes
    pub bytes_flushed: u64,
    /// Failed flush write attempts that were retried
    pub flush_retries: u64,
    /// Shard files opened
    pub shard_opens: u64,
    /// Inodes loaded from disk on cache miss
    pub inode_loads: u64,
    /// Reads that had to resynchronize
    pub resyncs: u64,
    /// Bytes skipped while resynchronizing
    pub resync_skipped_bytes: u64,
    /// Reads parked as waiters
    pub waiters_parked: u64,
    /// Waiters resolved by a flush
    pub waiters_serviced: u64,
    /// Waiters removed by cancel
    pub waiters_cancelled: u64,
}
