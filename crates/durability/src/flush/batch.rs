//! Batch serialization.
//!
//! A batch is built in two passes over the streams it touches:
//!
//! 1. Data area: each stream's previous partial tail is joined with its new
//!    bytes and every full block is copied into the buffer, its slot pointed
//!    at `base + position`.
//! 2. Tail and inode areas: each stream's sub-block remainder is written,
//!    then every touched inode version, oldest first.
//!
//! The batch ends with a [`BatchTrailer`].

use crate::error::{DurabilityError, Result};
use crate::inode::{Inode, InodeChain};
use std::sync::Arc;
use topiclog_storage::{BatchTrailer, TRAILER_SIZE};

/// New bytes for one stream.
#[derive(Debug)]
pub struct StreamWrite<'a> {
    /// The stream's chain, updated in place
    pub chain: InodeChain,

    /// Encoded records to append
    pub data: &'a [u8],
}

/// Durable head of one stream after a batch.
#[derive(Debug, Clone)]
pub struct StreamHead {
    /// Directory slot of the stream
    pub stream_slot: u32,

    /// Physical offset of the latest inode
    pub addr: u64,

    /// Latest inode
    pub inode: Arc<Inode>,

    /// Logical size of the stream
    pub size: u64,
}

/// A fully serialized batch, ready to be written at `trailer.batch_start`.
#[derive(Debug)]
pub struct SerializedBatch {
    /// Batch bytes, trailer included
    pub bytes: Vec<u8>,

    /// Trailer closing the batch
    pub trailer: BatchTrailer,

    /// New head of every stream in the batch, in batch order
    pub heads: Vec<StreamHead>,
}

impl SerializedBatch {
    /// Physical offset one past the batch.
    pub fn end(&self) -> u64 {
        self.trailer.batch_start + self.bytes.len() as u64
    }
}

/// Serialize `writes` into one batch starting at physical offset `base`.
///
/// The trailer is sealed with `database_uuid`.
pub fn serialize_batch(
    base: u64,
    database_uuid: &[u8; 16],
    writes: &mut [StreamWrite<'_>],
) -> Result<SerializedBatch> {
    let capacity = writes.iter().map(|w| w.data.len()).sum::<usize>() + TRAILER_SIZE;
    let mut buf = Vec::with_capacity(capacity);

    // Data area: full blocks only
    let mut remainders = Vec::with_capacity(writes.len());
    for write in writes.iter_mut() {
        let block_len = write.chain_block_len();
        let mut pending = write.chain.take_tail()?;
        pending.extend_from_slice(write.data);

        let full = pending.len() / block_len * block_len;
        for block in pending[..full].chunks(block_len) {
            let block_ref = write.chain.ref_payload_block()?;
            let physical = base + buf.len() as u64;
            buf.extend_from_slice(block);
            write.chain.commit_block(block_ref, physical, block_len)?;
        }
        pending.drain(..full);
        remainders.push(pending);
    }

    // Tail area
    for (write, remainder) in writes.iter_mut().zip(remainders) {
        if !remainder.is_empty() {
            let block_ref = write.chain.ref_payload_block()?;
            let physical = base + buf.len() as u64;
            buf.extend_from_slice(&remainder);
            write.chain.commit_block(block_ref, physical, remainder.len())?;
        }
        write.chain.set_tail(remainder);
    }

    // Inode area
    let inode_area_start = base + buf.len() as u64;
    let mut inode_count = 0u32;
    let mut heads = Vec::with_capacity(writes.len());
    for write in writes.iter_mut() {
        for handle in write.chain.take_touched() {
            write.chain.write_inode(handle, base, &mut buf)?;
            inode_count += 1;
        }
        let (addr, inode) = write.chain.durable_head()?.ok_or_else(|| {
            DurabilityError::corruption(format!(
                "stream {} has no inode after serialization",
                write.chain.stream_slot()
            ))
        })?;
        heads.push(StreamHead {
            stream_slot: write.chain.stream_slot(),
            addr,
            inode,
            size: write.chain.size(),
        });
    }

    let trailer = BatchTrailer {
        batch_start: base,
        inode_area_start,
        inode_count,
    };
    buf.extend_from_slice(&trailer.to_bytes(database_uuid));

    Ok(SerializedBatch {
        bytes: buf,
        trailer,
        heads,
    })
}

impl StreamWrite<'_> {
    fn chain_block_len(&self) -> usize {
        self.chain.geometry().block_size as usize
    }
}
