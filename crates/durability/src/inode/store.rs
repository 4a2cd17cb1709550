//! Shared cache of durable inodes.
//!
//! Durable inode versions are immutable, so the flush thread and any number
//! of readers can share them through one cache keyed by physical offset.

use super::format::{Inode, SKIP_LEVELS};
use crate::error::{DurabilityError, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use topiclog_core::{Geometry, Metrics};
use topiclog_storage::AddressSpace;
use tracing::trace;

/// Durable inodes kept in memory before the cache is reset
pub const INODE_CACHE_CAPACITY: usize = 4096;

/// Result of [`InodeStore::locate`].
#[derive(Debug, Clone)]
pub struct Located {
    /// Inode covering the requested block
    pub inode: Arc<Inode>,

    /// Skip-pointer jumps taken to reach it
    pub hops: usize,
}

/// Loads durable inodes through the address space and caches them.
pub struct InodeStore {
    space: Arc<AddressSpace>,
    geometry: Geometry,
    metrics: Arc<Metrics>,
    cache: Mutex<FxHashMap<u64, Arc<Inode>>>,
}

impl InodeStore {
    /// Create a store reading from `space`.
    pub fn new(space: Arc<AddressSpace>, geometry: Geometry, metrics: Arc<Metrics>) -> Self {
        InodeStore {
            space,
            geometry,
            metrics,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Geometry inodes are decoded with.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Address space inodes and blocks are read from.
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Inode written at physical offset `addr`.
    pub fn load(&self, addr: u64) -> Result<Arc<Inode>> {
        if let Some(inode) = self.cache.lock().get(&addr) {
            return Ok(Arc::clone(inode));
        }

        let mut bytes = vec![0u8; Inode::encoded_len(self.geometry.inode_slots)];
        self.space.read_exact_at(&mut bytes, addr)?;
        let (inode, _) = Inode::decode(&bytes, addr, &self.geometry)?;
        Metrics::incr(&self.metrics.inode_loads);
        trace!(target: "topiclog::inode", addr, start = inode.start, "Loaded inode");

        let inode = Arc::new(inode);
        self.insert(addr, Arc::clone(&inode));
        Ok(inode)
    }

    /// Install a freshly written inode.
    pub fn insert(&self, addr: u64, inode: Arc<Inode>) {
        let mut cache = self.cache.lock();
        if cache.len() >= INODE_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(addr, inode);
    }

    /// Whether `addr` is cached.
    pub fn is_cached(&self, addr: u64) -> bool {
        self.cache.lock().contains_key(&addr)
    }

    /// Drop every cached inode.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Find the inode covering logical `block`, walking back from `head`.
    ///
    /// Each step takes the largest skip pointer that does not overshoot the
    /// target, so reaching the k-th predecessor costs at most `popcount(k)`
    /// loads for `k < 2^SKIP_LEVELS`.
    pub fn locate(&self, head: &Arc<Inode>, block: u64) -> Result<Located> {
        let target = block / self.geometry.inode_slots as u64;
        let mut current = Arc::clone(head);
        let mut hops = 0;

        loop {
            let seq = current.seq(&self.geometry);
            if seq == target {
                return Ok(Located {
                    inode: current,
                    hops,
                });
            }
            if target > seq {
                return Err(DurabilityError::SlotOutOfRange {
                    block,
                    start: current.start,
                    slots: self.geometry.inode_slots,
                });
            }

            let distance = seq - target;
            let level = (63 - distance.leading_zeros() as usize).min(SKIP_LEVELS - 1);
            let next = current.skips[level].ok_or_else(|| {
                DurabilityError::corruption(format!(
                    "inode {} has no skip pointer at level {}",
                    seq, level
                ))
            })?;
            let inode = self.load(next)?;
            if inode.seq(&self.geometry) != seq - (1 << level) {
                return Err(DurabilityError::corruption(format!(
                    "skip pointer {} of inode {} leads to inode {}",
                    level,
                    seq,
                    inode.seq(&self.geometry)
                )));
            }
            current = inode;
            hops += 1;
        }
    }
}

impl std::fmt::Debug for InodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeStore")
            .field("geometry", &self.geometry)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}
