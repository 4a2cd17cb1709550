//! Per-stream inode chain.
//!
//! The chain owns the stream's write position. Every flush that extends the
//! stream works on an in-memory copy of the current inode (copy-on-write
//! from its durable version), fills slots through [`InodeChain::ref_payload_block`]
//! and [`InodeChain::commit_block`], and finally writes each touched version
//! with [`InodeChain::write_inode`], which moves it from the arena to disk.
//!
//! Chains are owned by the flush thread. Readers never see them; they walk
//! durable inodes through the shared [`InodeStore`].

use super::address::{Address, InodeArena, InodeHandle};
use super::format::{Inode, SKIP_LEVELS};
use super::store::InodeStore;
use crate::error::{DurabilityError, Result};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;
use topiclog_core::Geometry;
use tracing::debug;

/// Sealed inodes remembered for skip-pointer resolution
const SEALED_WINDOW: usize = 1 << (SKIP_LEVELS - 1);

/// Slot reserved by [`InodeChain::ref_payload_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    /// In-memory inode owning the slot
    pub handle: InodeHandle,
    /// Slot index within the inode
    pub slot: usize,
    /// Logical block number
    pub block: u64,
}

/// Block map of one stream, from its first inode to the current one.
#[derive(Debug, Clone)]
pub struct InodeChain {
    stream_slot: u32,
    geometry: Geometry,
    store: Arc<InodeStore>,
    arena: InodeArena,
    current: Option<Address>,
    size: u64,
    tail: Option<Vec<u8>>,
    touched: SmallVec<[InodeHandle; 4]>,
    sealed: VecDeque<(u64, u64)>,
}

impl InodeChain {
    /// Chain for a stream with no data.
    pub fn new(stream_slot: u32, store: Arc<InodeStore>) -> Self {
        InodeChain {
            stream_slot,
            geometry: *store.geometry(),
            store,
            arena: InodeArena::new(),
            current: None,
            size: 0,
            tail: Some(Vec::new()),
            touched: SmallVec::new(),
            sealed: VecDeque::with_capacity(SEALED_WINDOW),
        }
    }

    /// Chain continuing from a durable head inode.
    ///
    /// The partial tail block is not known yet; it is re-read from disk the
    /// first time the stream is extended.
    pub fn resume(
        stream_slot: u32,
        store: Arc<InodeStore>,
        head_addr: u64,
        head: Arc<Inode>,
    ) -> Self {
        let mut chain = Self::new(stream_slot, store);
        chain.size = head.logical_end(&chain.geometry);
        chain.current = Some(Address::OnDisk(head_addr));
        chain.tail = None;
        if head.is_full(&chain.geometry) {
            chain.record_sealed(head.seq(&chain.geometry), head_addr);
        }
        chain
    }

    /// Directory slot of the owning stream.
    pub fn stream_slot(&self) -> u32 {
        self.stream_slot
    }

    /// Geometry of the chain's inodes.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Logical size of the stream, including uncommitted blocks.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Address of the current inode version.
    pub fn current(&self) -> Option<Address> {
        self.current
    }

    /// Physical offset of the current inode, once it is flushed.
    pub fn latest_addr(&self) -> Option<u64> {
        self.current.and_then(|a| a.on_disk())
    }

    /// Number of inode versions not yet written.
    pub fn in_memory(&self) -> usize {
        self.arena.len()
    }

    /// Current inode version.
    pub fn get_latest(&self) -> Result<Option<Arc<Inode>>> {
        self.current.map(|addr| self.get_by_addr(addr)).transpose()
    }

    /// Inode version at `addr`, from the arena or through the store.
    pub fn get_by_addr(&self, addr: Address) -> Result<Arc<Inode>> {
        match addr {
            Address::InMemory(handle) => Ok(Arc::new(self.arena_get(handle)?.clone())),
            Address::OnDisk(addr) => self.store.load(addr),
        }
    }

    /// Current inode if it is durable, with its address.
    pub fn durable_head(&self) -> Result<Option<(u64, Arc<Inode>)>> {
        match self.current {
            Some(Address::OnDisk(addr)) => Ok(Some((addr, self.store.load(addr)?))),
            _ => Ok(None),
        }
    }

    /// Reserve the slot of the block containing the stream end.
    ///
    /// When the stream has a partial tail this is the tail's slot, which the
    /// caller rewrites with the tail plus new data. When the current inode
    /// is full a new one is allocated with `start = prev.start + N`.
    pub fn ref_payload_block(&mut self) -> Result<BlockRef> {
        let block = self.geometry.block_of(self.size);
        let n = self.geometry.inode_slots as u64;

        match self.current_start()? {
            Some(start) if block < start + n => {}
            Some(start) => self.roll_over(start + n),
            None => self.roll_over(0),
        }

        let handle = self.writable()?;
        let inode = self.arena_get(handle)?;
        let slot = inode.slot_for_block(block)?;
        Ok(BlockRef {
            handle,
            slot,
            block,
        })
    }

    /// Point a reserved slot at `len` bytes written at `physical`.
    pub fn commit_block(&mut self, block_ref: BlockRef, physical: u64, len: usize) -> Result<()> {
        let block_len = self.geometry.block_len();
        if len == 0 || len as u64 > block_len {
            return Err(DurabilityError::corruption(format!(
                "block of {} bytes does not fit block size {}",
                len, block_len
            )));
        }
        if block_ref.block != self.geometry.block_of(self.size) {
            return Err(DurabilityError::corruption(format!(
                "block {} committed while stream ends in block {}",
                block_ref.block,
                self.geometry.block_of(self.size)
            )));
        }

        let geometry = self.geometry;
        let inode = self.arena_get_mut(block_ref.handle)?;
        let slot = inode.slot_for_block(block_ref.block)?;
        let slot_end = (slot as u64 + 1) * block_len;
        if inode.size >= slot_end {
            return Err(DurabilityError::corruption(format!(
                "full block {} rewritten",
                block_ref.block
            )));
        }
        inode.slots[slot] = Some(physical);
        inode.size = slot as u64 * block_len + len as u64;
        let size = inode.logical_end(&geometry);
        self.size = size;
        Ok(())
    }

    /// Bytes of the partial tail block, re-read from disk if not cached.
    pub fn take_tail(&mut self) -> Result<Vec<u8>> {
        let tail_len = (self.size % self.geometry.block_len()) as usize;
        if tail_len == 0 {
            self.tail = Some(Vec::new());
            return Ok(Vec::new());
        }
        if let Some(tail) = self.tail.take() {
            if tail.len() == tail_len {
                return Ok(tail);
            }
        }

        let block = self.geometry.block_of(self.size);
        let inode = self
            .get_latest()?
            .ok_or_else(|| DurabilityError::corruption("stream has a tail but no inode"))?;
        let addr = inode.block_address(block)?.ok_or_else(|| {
            DurabilityError::corruption(format!("tail block {} has no address", block))
        })?;

        let mut tail = vec![0u8; tail_len];
        self.store.space().read_exact_at(&mut tail, addr)?;
        debug!(
            target: "topiclog::inode",
            stream_slot = self.stream_slot,
            block,
            len = tail_len,
            "Re-read partial tail block"
        );
        Ok(tail)
    }

    /// Cache the partial tail block just written.
    pub fn set_tail(&mut self, tail: Vec<u8>) {
        self.tail = Some(tail);
    }

    /// In-memory versions modified since the last call, oldest first.
    pub fn take_touched(&mut self) -> SmallVec<[InodeHandle; 4]> {
        std::mem::take(&mut self.touched)
    }

    /// Append the inode behind `handle` to a batch buffer starting at
    /// physical offset `base`, and move it to disk.
    ///
    /// Returns the physical offset the inode is written at. Predecessors must
    /// already be written, so inodes of one stream go out oldest first.
    pub fn write_inode(&mut self, handle: InodeHandle, base: u64, buf: &mut Vec<u8>) -> Result<u64> {
        let addr = base + buf.len() as u64;
        self.resolve_skips(handle)?;
        self.arena_get(handle)?.encode_into(addr, buf)?;
        self.on_flush(handle, addr)?;
        Ok(addr)
    }

    /// Move an inode version from the arena to `addr`.
    ///
    /// The in-memory handle stops resolving and the durable version is
    /// installed in the store. This is the only transition an inode version
    /// makes.
    pub fn on_flush(&mut self, handle: InodeHandle, addr: u64) -> Result<Arc<Inode>> {
        let inode = self
            .arena
            .remove(handle)
            .ok_or_else(|| DurabilityError::corruption(format!("stale inode handle {}", handle)))?;
        let inode = Arc::new(inode);

        if inode.is_full(&self.geometry) {
            self.record_sealed(inode.seq(&self.geometry), addr);
        }
        self.store.insert(addr, Arc::clone(&inode));
        if self.current == Some(Address::InMemory(handle)) {
            self.current = Some(Address::OnDisk(addr));
        }
        Ok(inode)
    }

    fn current_start(&self) -> Result<Option<u64>> {
        match self.current {
            None => Ok(None),
            Some(Address::InMemory(handle)) => Ok(Some(self.arena_get(handle)?.start)),
            Some(Address::OnDisk(addr)) => Ok(Some(self.store.load(addr)?.start)),
        }
    }

    fn roll_over(&mut self, start: u64) {
        if let Some(Address::OnDisk(addr)) = self.current {
            let seq = start / self.geometry.inode_slots as u64;
            if seq > 0 {
                self.record_sealed(seq - 1, addr);
            }
        }
        let handle = self
            .arena
            .insert(Inode::empty(self.stream_slot, start, &self.geometry));
        self.touched.push(handle);
        self.current = Some(Address::InMemory(handle));
    }

    /// Handle of a writable version of the current inode.
    fn writable(&mut self) -> Result<InodeHandle> {
        match self.current {
            Some(Address::InMemory(handle)) => Ok(handle),
            Some(Address::OnDisk(addr)) => {
                let inode = self.store.load(addr)?;
                let handle = self.arena.insert((*inode).clone());
                self.touched.push(handle);
                self.current = Some(Address::InMemory(handle));
                Ok(handle)
            }
            None => {
                self.roll_over(0);
                match self.current {
                    Some(Address::InMemory(handle)) => Ok(handle),
                    _ => Err(DurabilityError::corruption("first inode not allocated")),
                }
            }
        }
    }

    /// Fill in skip pointers of a new inode, once its predecessors are on disk.
    ///
    /// Pointer `k` comes from the sealed window when the predecessor at
    /// distance `2^k` is recent, otherwise from pointer `k-1` of the
    /// predecessor at distance `2^(k-1)`.
    fn resolve_skips(&mut self, handle: InodeHandle) -> Result<()> {
        let (seq, resolved) = {
            let inode = self.arena_get(handle)?;
            (inode.seq(&self.geometry), inode.skips[0].is_some())
        };
        if seq == 0 || resolved {
            return Ok(());
        }

        let mut skips = [None; SKIP_LEVELS];
        for k in 0..SKIP_LEVELS {
            let distance = 1u64 << k;
            if distance > seq {
                break;
            }
            skips[k] = match self.sealed_addr(seq - distance) {
                Some(addr) => Some(addr),
                None if k > 0 => match skips[k - 1] {
                    Some(prev) => self.store.load(prev)?.skips[k - 1],
                    None => None,
                },
                None => None,
            };
            if skips[k].is_none() {
                return Err(DurabilityError::corruption(format!(
                    "inode {} of stream {} has no predecessor at distance {}",
                    seq, self.stream_slot, distance
                )));
            }
        }

        self.arena_get_mut(handle)?.skips = skips;
        Ok(())
    }

    fn record_sealed(&mut self, seq: u64, addr: u64) {
        self.sealed.retain(|(s, _)| *s != seq);
        self.sealed.push_back((seq, addr));
        while self.sealed.len() > SEALED_WINDOW {
            self.sealed.pop_front();
        }
    }

    fn sealed_addr(&self, seq: u64) -> Option<u64> {
        self.sealed
            .iter()
            .rev()
            .find(|(s, _)| *s == seq)
            .map(|(_, addr)| *addr)
    }

    fn arena_get(&self, handle: InodeHandle) -> Result<&Inode> {
        self.arena
            .get(handle)
            .ok_or_else(|| DurabilityError::corruption(format!("stale inode handle {}", handle)))
    }

    fn arena_get_mut(&mut self, handle: InodeHandle) -> Result<&mut Inode> {
        self.arena
            .get_mut(handle)
            .ok_or_else(|| DurabilityError::corruption(format!("stale inode handle {}", handle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use topiclog_core::Metrics;
    use topiclog_storage::AddressSpace;

    fn store(dir: &std::path::Path) -> Arc<InodeStore> {
        let metrics = Arc::new(Metrics::new());
        let space = Arc::new(AddressSpace::open(dir, 16, Arc::clone(&metrics)).unwrap());
        Arc::new(InodeStore::new(space, Geometry::new(16, 2).unwrap(), metrics))
    }

    #[test]
    fn test_first_block_allocates_inode() {
        let dir = tempdir().unwrap();
        let mut chain = InodeChain::new(1, store(dir.path()));
        assert!(chain.get_latest().unwrap().is_none());

        let r = chain.ref_payload_block().unwrap();
        assert_eq!((r.slot, r.block), (0, 0));
        chain.commit_block(r, 100, 16).unwrap();
        assert_eq!(chain.size(), 16);

        let r = chain.ref_payload_block().unwrap();
        assert_eq!((r.slot, r.block), (1, 1));
        chain.commit_block(r, 200, 5).unwrap();
        assert_eq!(chain.size(), 21);
        assert_eq!(chain.take_touched().len(), 1);
        assert_eq!(chain.in_memory(), 1);
    }

    #[test]
    fn test_tail_slot_is_repointed() {
        let dir = tempdir().unwrap();
        let mut chain = InodeChain::new(0, store(dir.path()));
        let r = chain.ref_payload_block().unwrap();
        chain.commit_block(r, 100, 5).unwrap();

        // Stream still ends inside block 0, so the same slot comes back
        let r = chain.ref_payload_block().unwrap();
        assert_eq!(r.block, 0);
        chain.commit_block(r, 300, 12).unwrap();
        assert_eq!(chain.size(), 12);
        let latest = chain.get_latest().unwrap().unwrap();
        assert_eq!(latest.slots[0], Some(300));
    }

    #[test]
    fn test_full_block_is_never_rewritten() {
        let dir = tempdir().unwrap();
        let mut chain = InodeChain::new(0, store(dir.path()));
        let r = chain.ref_payload_block().unwrap();
        chain.commit_block(r, 100, 16).unwrap();
        assert!(chain.commit_block(r, 200, 16).is_err());
    }

    #[test]
    fn test_rollover_allocates_next_inode() {
        let dir = tempdir().unwrap();
        let mut chain = InodeChain::new(0, store(dir.path()));
        for i in 0..2 {
            let r = chain.ref_payload_block().unwrap();
            chain.commit_block(r, i * 16, 16).unwrap();
        }
        let r = chain.ref_payload_block().unwrap();
        assert_eq!((r.slot, r.block), (0, 2));
        assert_eq!(chain.take_touched().len(), 2);
    }

    #[test]
    fn test_write_inode_moves_version_to_disk() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut chain = InodeChain::new(0, Arc::clone(&store));
        let r = chain.ref_payload_block().unwrap();
        chain.commit_block(r, 0, 7).unwrap();

        let mut buf = vec![0u8; 7];
        let handles = chain.take_touched();
        let addr = chain.write_inode(handles[0], 0, &mut buf).unwrap();
        assert_eq!(addr, 7);
        assert_eq!(chain.in_memory(), 0);
        assert_eq!(chain.current(), Some(Address::OnDisk(7)));
        assert!(store.is_cached(7));

        // A second write of the same version is rejected
        assert!(chain.on_flush(handles[0], 100).is_err());

        // Extending again works on a fresh copy of the durable version
        let r = chain.ref_payload_block().unwrap();
        assert_ne!(r.handle, handles[0]);
        assert_eq!(chain.take_touched().len(), 1);
    }

    #[test]
    fn test_resume_rereads_tail() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut chain = InodeChain::new(0, Arc::clone(&store));

        let r = chain.ref_payload_block().unwrap();
        let mut buf = b"tail-bytes".to_vec();
        chain.commit_block(r, 0, buf.len()).unwrap();
        let handle = chain.take_touched()[0];
        let addr = chain.write_inode(handle, 0, &mut buf).unwrap();
        store.space().write_at(&buf, 0).unwrap();

        store.clear_cache();
        let head = store.load(addr).unwrap();
        let mut resumed = InodeChain::resume(0, Arc::clone(&store), addr, head);
        assert_eq!(resumed.size(), 10);
        assert_eq!(resumed.take_tail().unwrap(), b"tail-bytes".to_vec());
    }
}
