//! Stream state shared between producers, the flush thread and readers.

use crate::inode::Inode;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Durable state of a stream as of its last flush.
#[derive(Debug, Clone)]
pub struct DurableView {
    /// Latest durable inode
    pub head: Arc<Inode>,

    /// Physical offset of `head`
    pub head_addr: u64,

    /// Durable logical size of the stream
    pub size: u64,
}

/// One named stream.
///
/// Producers serialize on the append lock, which guards the next record id;
/// ids are assigned and the append is queued inside the same critical
/// section so queue order equals id order. The flush thread publishes a new
/// [`DurableView`] after every batch that includes the stream.
#[derive(Debug)]
pub struct StreamLog {
    name: String,
    slot: u32,
    next_offset: Mutex<u64>,
    durable: RwLock<Option<DurableView>>,
    durable_size: AtomicU64,
}

impl StreamLog {
    /// Stream starting from a durable view, or empty.
    pub fn new(name: impl Into<String>, slot: u32, view: Option<DurableView>) -> Self {
        let size = view.as_ref().map_or(0, |v| v.size);
        StreamLog {
            name: name.into(),
            slot,
            next_offset: Mutex::new(size),
            durable: RwLock::new(view),
            durable_size: AtomicU64::new(size),
        }
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory slot.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Lock the append section; the guard holds the next record id.
    pub fn lock_append(&self) -> MutexGuard<'_, u64> {
        self.next_offset.lock()
    }

    /// Offset the next appended record will get.
    pub fn next_offset(&self) -> u64 {
        *self.next_offset.lock()
    }

    /// Logical size covered by flushed batches.
    pub fn durable_size(&self) -> u64 {
        self.durable_size.load(Ordering::SeqCst)
    }

    /// Latest durable view, if the stream has flushed data.
    pub fn durable_view(&self) -> Option<DurableView> {
        self.durable.read().clone()
    }

    pub(crate) fn publish(&self, view: DurableView) {
        let size = view.size;
        *self.durable.write() = Some(view);
        self.durable_size.store(size, Ordering::SeqCst);
    }
}
