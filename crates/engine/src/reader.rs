//! Durable record reads
//!
//! A read starts from a stream's [`DurableView`]: the head inode and the
//! durable size. Logical bytes are fetched block by block through the inode
//! chain into a window, and records are decoded out of the window with the
//! resynchronizing decoder. The window grows when a record spans its end.
//!
//! Reads never look past the durable size, so they only ever touch inodes
//! that are already on disk and immutable.

use crate::error::EngineResult;
use std::sync::Arc;
use topiclog_core::Metrics;
use topiclog_durability::{DurabilityError, DurableView, Inode, InodeStore};
use topiclog_storage::{CodecError, Record};
use tracing::{trace, warn};

/// Bytes fetched per window refill
pub const READ_CHUNK: usize = 64 * 1024;

/// Records decoded by one read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadBatch {
    /// Records in offset order
    pub records: Vec<Record>,

    /// Offset following the last record read
    pub next_offset: u64,
}

/// Decodes records from durable stream data.
#[derive(Debug, Clone)]
pub struct StreamReader {
    inodes: Arc<InodeStore>,
    metrics: Arc<Metrics>,
}

impl StreamReader {
    /// Reader over the inodes of one database.
    pub fn new(inodes: Arc<InodeStore>, metrics: Arc<Metrics>) -> Self {
        StreamReader { inodes, metrics }
    }

    /// Read up to `max_records` records starting at `offset`.
    ///
    /// Stops early at the durable end of the stream; `next_offset` is then
    /// the offset the next record will be written at. Corrupt bytes are
    /// skipped by resynchronization, which fails the read only once the
    /// scan budget is spent.
    pub fn read(
        &self,
        view: &DurableView,
        offset: u64,
        max_records: usize,
    ) -> EngineResult<ReadBatch> {
        let mut records = Vec::new();
        let mut pos = offset;
        let mut window_start = offset;
        let mut window: Vec<u8> = Vec::new();
        let mut cursor: Option<Arc<Inode>> = None;

        while records.len() < max_records && pos < view.size {
            let end_of_data = window_start + window.len() as u64 >= view.size;
            let local = &window[(pos - window_start) as usize..];

            match Record::decode_resync(local, Some(pos), end_of_data) {
                Ok(found) => {
                    if found.skipped > 0 {
                        Metrics::incr(&self.metrics.resyncs);
                        Metrics::add(&self.metrics.resync_skipped_bytes, found.skipped as u64);
                        warn!(
                            target: "topiclog::reader",
                            offset = pos,
                            skipped = found.skipped,
                            "Resynchronized past corrupt bytes"
                        );
                    }
                    pos += found.consumed as u64;
                    records.push(found.record);
                }
                // Only reported while more durable bytes remain
                Err(CodecError::Truncated { needed }) => {
                    let len = refill_len(needed, local.len(), view.size - pos);
                    window = self.read_bytes(view, &mut cursor, pos, len)?;
                    window_start = pos;
                }
                Err(e) => {
                    if matches!(e, CodecError::ResyncLimitExceeded { .. }) {
                        warn!(target: "topiclog::reader", offset = pos, error = %e, "Resync gave up");
                    }
                    return Err(e.into());
                }
            }
        }

        trace!(
            target: "topiclog::reader",
            offset,
            records = records.len(),
            next_offset = pos,
            "Read durable records"
        );
        Ok(ReadBatch {
            records,
            next_offset: pos,
        })
    }

    /// Copy `len` logical bytes at `pos` out of the stream's blocks.
    fn read_bytes(
        &self,
        view: &DurableView,
        cursor: &mut Option<Arc<Inode>>,
        pos: u64,
        len: usize,
    ) -> EngineResult<Vec<u8>> {
        let block_len = self.inodes.geometry().block_len();
        let mut out = vec![0u8; len];
        let mut filled = 0usize;

        while filled < len {
            let at = pos + filled as u64;
            let block = at / block_len;
            let inode = self.inode_for(view, cursor, block)?;
            let physical = inode.block_address(block)?.ok_or_else(|| {
                DurabilityError::corruption(format!(
                    "block {} below durable size {} has no address",
                    block, view.size
                ))
            })?;

            let in_block = at - block * block_len;
            let n = ((block_len - in_block) as usize).min(len - filled);
            self.inodes
                .space()
                .read_exact_at(&mut out[filled..filled + n], physical + in_block)?;
            filled += n;
        }
        Ok(out)
    }

    /// Inode covering `block`, reusing the last one located when it fits.
    fn inode_for(
        &self,
        view: &DurableView,
        cursor: &mut Option<Arc<Inode>>,
        block: u64,
    ) -> EngineResult<Arc<Inode>> {
        let slots = self.inodes.geometry().inode_slots as u64;
        if let Some(inode) = cursor {
            if inode.start <= block && block < inode.start + slots {
                return Ok(Arc::clone(inode));
            }
        }
        let located = self.inodes.locate(&view.head, block)?;
        *cursor = Some(Arc::clone(&located.inode));
        Ok(located.inode)
    }
}

/// Window length for a refill at the current position.
///
/// At least `needed` and `READ_CHUNK`, and at least double the bytes already
/// held past the position, capped at the durable bytes left.
fn refill_len(needed: usize, held: usize, left: u64) -> usize {
    let len = needed.max(READ_CHUNK).max(held.saturating_mul(2));
    (len as u64).min(left) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use topiclog_core::Geometry;
    use topiclog_durability::{serialize_batch, InodeChain, StreamWrite};
    use topiclog_storage::AddressSpace;

    struct Fixture {
        _dir: tempfile::TempDir,
        metrics: Arc<Metrics>,
        inodes: Arc<InodeStore>,
        chain: Option<InodeChain>,
        end: u64,
        next_id: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let metrics = Arc::new(Metrics::new());
            let space = Arc::new(AddressSpace::open(dir.path(), 16, Arc::clone(&metrics)).unwrap());
            let inodes = Arc::new(InodeStore::new(
                space,
                Geometry::new(32, 4).unwrap(),
                Arc::clone(&metrics),
            ));
            let chain = InodeChain::new(0, Arc::clone(&inodes));
            Fixture {
                _dir: dir,
                metrics,
                inodes,
                chain: Some(chain),
                end: 0,
                next_id: 0,
            }
        }

        /// Flush raw stream bytes as one batch.
        fn flush_raw(&mut self, data: &[u8]) -> DurableView {
            let chain = self.chain.take().unwrap();
            let mut writes = vec![StreamWrite { chain, data }];
            let batch = serialize_batch(self.end, &[1; 16], &mut writes).unwrap();
            self.inodes.space().write_at(&batch.bytes, self.end).unwrap();
            self.end = batch.end();
            self.chain = writes.pop().map(|w| w.chain);

            let head = &batch.heads[0];
            self.next_id = head.size;
            DurableView {
                head: Arc::clone(&head.inode),
                head_addr: head.addr,
                size: head.size,
            }
        }

        fn flush_records(&mut self, payloads: &[&[u8]]) -> DurableView {
            let mut bytes = Vec::new();
            for payload in payloads {
                let id = self.next_id + bytes.len() as u64;
                Record::encode_parts(id, 1, payload, &mut bytes).unwrap();
            }
            self.flush_raw(&bytes)
        }

        fn reader(&self) -> StreamReader {
            StreamReader::new(Arc::clone(&self.inodes), Arc::clone(&self.metrics))
        }
    }

    #[test]
    fn test_reads_records_across_blocks_and_batches() {
        let mut f = Fixture::new();
        f.flush_records(&[&[1u8; 20][..], &[2u8; 38][..]]);
        let view = f.flush_records(&[&[3u8; 5][..], &[4u8; 100][..]]);

        let batch = f.reader().read(&view, 0, 10).unwrap();
        let sizes: Vec<usize> = batch.records.iter().map(|r| r.payload.len()).collect();
        assert_eq!(sizes, vec![20, 38, 5, 100]);
        assert_eq!(batch.records[3].payload, vec![4u8; 100]);
        assert_eq!(batch.next_offset, view.size);
        assert_eq!(batch.next_offset, 4 * 19 + 163);
    }

    #[test]
    fn test_read_respects_max_records_and_offset() {
        let mut f = Fixture::new();
        let view = f.flush_records(&[&b"a"[..], &b"bb"[..], &b"ccc"[..]]);

        let batch = f.reader().read(&view, 0, 2).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.next_offset, 20 + 21);

        let rest = f.reader().read(&view, batch.next_offset, 10).unwrap();
        assert_eq!(rest.records.len(), 1);
        assert_eq!(rest.records[0].payload, b"ccc");
        assert_eq!(rest.records[0].id, 41);
    }

    #[test]
    fn test_read_at_durable_end_is_empty() {
        let mut f = Fixture::new();
        let view = f.flush_records(&[&b"only"[..]]);
        let batch = f.reader().read(&view, view.size, 5).unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.next_offset, view.size);
    }

    #[test]
    fn test_resyncs_past_garbage_between_records() {
        let mut f = Fixture::new();
        let mut bytes = vec![0x11u8; 7];
        Record::encode_parts(7, 1, b"after garbage", &mut bytes).unwrap();
        let view = f.flush_raw(&bytes);

        let batch = f.reader().read(&view, 0, 1).unwrap();
        assert_eq!(batch.records[0].payload, b"after garbage");
        assert_eq!(batch.records[0].id, 7);
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.resyncs, 1);
        assert_eq!(snapshot.resync_skipped_bytes, 7);
    }

    #[test]
    fn test_refill_grows_geometrically() {
        assert_eq!(refill_len(19, 0, 1 << 30), READ_CHUNK);
        assert_eq!(refill_len(READ_CHUNK + 19, READ_CHUNK, 1 << 30), 2 * READ_CHUNK);
        assert_eq!(refill_len(500_000, 10, 1 << 30), 500_000);
        assert_eq!(refill_len(READ_CHUNK, READ_CHUNK, 1000), 1000);
    }

    #[test]
    fn test_resyncs_past_long_garbage_run() {
        let mut f = Fixture::new();
        let garbage = 4 * READ_CHUNK + 123;
        let mut bytes = vec![0u8; garbage];
        Record::encode_parts(garbage as u64, 1, b"survivor", &mut bytes).unwrap();
        let view = f.flush_raw(&bytes);

        let batch = f.reader().read(&view, 0, 1).unwrap();
        assert_eq!(batch.records[0].payload, b"survivor");
        assert_eq!(batch.next_offset, view.size);
        assert_eq!(f.metrics.snapshot().resync_skipped_bytes, garbage as u64);
    }

    #[test]
    fn test_large_record_grows_window() {
        let mut f = Fixture::new();
        let big = vec![9u8; READ_CHUNK + 500];
        let view = f.flush_records(&[&b"x"[..], big.as_slice(), &b"y"[..]]);

        let batch = f.reader().read(&view, 0, 3).unwrap();
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.records[1].payload, big);
        assert_eq!(batch.records[2].payload, b"y");
    }
}
