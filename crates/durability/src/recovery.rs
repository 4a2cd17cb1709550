//! Crash recovery.
//!
//! The header records the checkpoint of the last batch whose header update
//! completed. On open:
//!
//! 1. A valid trailer must end exactly at the checkpoint. If it does not
//!    (the file was truncated, or the batch was torn), scan backward from
//!    `min(checkpoint, physical_end)` for the last trailer that closes a
//!    batch and roll the durable pointer back to it. A candidate counts only
//!    if its inode area decodes and the batch before it ends in a trailer
//!    too; trailer-shaped bytes inside record payloads are skipped.
//! 2. Streams whose directory entry points at or past the new durable
//!    pointer are rewound: committed batches are walked backward through
//!    their trailers and inode areas until each stream's newest surviving
//!    inode is found. Streams with none left become empty.
//! 3. The corrected header is persisted before any new write.
//!
//! Bytes past the durable pointer are free space and will be overwritten.

use crate::error::{DurabilityError, Result};
use crate::inode::{Inode, InodeStore};
use rustc_hash::FxHashMap;
use topiclog_core::EngineConfig;
use topiclog_storage::{AddressSpace, BatchTrailer, Header, HeaderStore, TRAILER_SIZE};
use tracing::{info, warn};

/// Bytes read per step of the backward trailer scan
const SCAN_CHUNK: u64 = 1 << 20;

/// What recovery found and changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// No header existed; a new database was created
    pub created: bool,

    /// Checkpoint recorded in the header
    pub checkpoint: u64,

    /// One past the last byte on disk
    pub physical_end: u64,

    /// Durable pointer after recovery
    pub durable_pointer: u64,

    /// Bytes between the recovered pointer and the recorded checkpoint
    pub rolled_back_bytes: u64,

    /// Batches whose inode areas were decoded to rewind streams
    pub batches_scanned: u64,

    /// Streams whose latest inode was rewound
    pub streams_rewound: Vec<String>,
}

impl RecoveryReport {
    /// Whether the database was reopened without losing anything.
    pub fn is_clean(&self) -> bool {
        self.rolled_back_bytes == 0 && self.streams_rewound.is_empty()
    }
}

/// Recovered header plus report.
#[derive(Debug, Clone)]
pub struct Recovered {
    /// Header as of the durable pointer, already persisted
    pub header: Header,

    /// What recovery did
    pub report: RecoveryReport,
}

/// Open or create the database described by `config`.
pub fn recover(
    config: &EngineConfig,
    space: &AddressSpace,
    headers: &HeaderStore,
    inodes: &InodeStore,
) -> Result<Recovered> {
    let physical_end = space.physical_end()?;

    if !headers.exists() {
        let header = Header::new(config.geometry, config.shard_bit);
        headers.persist(&header)?;
        info!(
            target: "topiclog::recovery",
            path = %headers.path().display(),
            block_size = config.geometry.block_size,
            inode_slots = config.geometry.inode_slots,
            "Created new database"
        );
        return Ok(Recovered {
            header,
            report: RecoveryReport {
                created: true,
                physical_end,
                ..RecoveryReport::default()
            },
        });
    }

    let mut header = headers.load()?;
    if header.geometry != config.geometry || header.shard_bit != config.shard_bit {
        return Err(DurabilityError::GeometryMismatch {
            expected: format!(
                "{:?}, shard bit {}",
                config.geometry, config.shard_bit
            ),
            found: format!("{:?}, shard bit {}", header.geometry, header.shard_bit),
        });
    }

    let checkpoint = header.checkpoint;
    let database_uuid = header.database_uuid;
    let durable = if checkpoint == 0 || trailer_at(space, checkpoint, &database_uuid)?.is_some() {
        checkpoint
    } else {
        let from = checkpoint.min(physical_end);
        let found = scan_back(space, inodes, from, &database_uuid)?.unwrap_or(0);
        warn!(
            target: "topiclog::recovery",
            checkpoint,
            physical_end,
            recovered = found,
            "No batch trailer at checkpoint, rolled back to last committed batch"
        );
        found
    };

    let mut report = RecoveryReport {
        created: false,
        checkpoint,
        physical_end,
        durable_pointer: durable,
        rolled_back_bytes: checkpoint - durable,
        batches_scanned: 0,
        streams_rewound: Vec::new(),
    };

    rewind_streams(space, inodes, &mut header, durable, &mut report)?;

    if durable != checkpoint || !report.streams_rewound.is_empty() {
        header.checkpoint = durable;
        headers.persist(&header)?;
    }

    info!(
        target: "topiclog::recovery",
        durable_pointer = durable,
        streams = header.streams().count(),
        rolled_back = report.rolled_back_bytes,
        rewound = report.streams_rewound.len(),
        "Recovery complete"
    );
    Ok(Recovered { header, report })
}

/// The trailer ending exactly at `end`, if there is a valid one.
fn trailer_at(
    space: &AddressSpace,
    end: u64,
    database_uuid: &[u8; 16],
) -> Result<Option<BatchTrailer>> {
    let Some(start) = end.checked_sub(TRAILER_SIZE as u64) else {
        return Ok(None);
    };
    let mut raw = [0u8; TRAILER_SIZE];
    if space.read_at(&mut raw, start)? < TRAILER_SIZE {
        return Ok(None);
    }
    Ok(BatchTrailer::parse_at(&raw, end, database_uuid))
}

/// Whether the inode area of `trailer` has the size its inodes need.
///
/// Every batch writes at least one inode, and inodes have a fixed encoded
/// length.
fn inode_area_fits(trailer: &BatchTrailer, end: u64, inode_slots: u32) -> bool {
    let area_len = end - TRAILER_SIZE as u64 - trailer.inode_area_start;
    trailer.inode_count > 0
        && area_len == trailer.inode_count as u64 * Inode::encoded_len(inode_slots) as u64
}

/// Whether `trailer`, found at `end` by scanning, closes a real batch.
fn closes_batch(
    space: &AddressSpace,
    inodes: &InodeStore,
    end: u64,
    trailer: &BatchTrailer,
    database_uuid: &[u8; 16],
) -> Result<bool> {
    let geometry = *inodes.geometry();
    if !inode_area_fits(trailer, end, geometry.inode_slots) {
        return Ok(false);
    }

    let mut area = vec![0u8; (end - TRAILER_SIZE as u64 - trailer.inode_area_start) as usize];
    space.read_exact_at(&mut area, trailer.inode_area_start)?;
    let mut pos = 0usize;
    for _ in 0..trailer.inode_count {
        let addr = trailer.inode_area_start + pos as u64;
        match Inode::decode(&area[pos..], addr, &geometry) {
            Ok((_, used)) => pos += used,
            Err(_) => return Ok(false),
        }
    }

    if trailer.batch_start == 0 {
        return Ok(true);
    }
    Ok(trailer_at(space, trailer.batch_start, database_uuid)?
        .map_or(false, |prev| inode_area_fits(&prev, trailer.batch_start, geometry.inode_slots)))
}

/// End of the last trailer at or before `from` that closes a batch.
fn scan_back(
    space: &AddressSpace,
    inodes: &InodeStore,
    from: u64,
    database_uuid: &[u8; 16],
) -> Result<Option<u64>> {
    let mut end = from;
    while end >= TRAILER_SIZE as u64 {
        let start = end.saturating_sub(SCAN_CHUNK);
        let mut window = vec![0u8; (end - start) as usize];
        let n = space.read_at(&mut window, start)?;
        window.truncate(n);

        let mut limit = window.len();
        while let Some((found, trailer)) =
            BatchTrailer::find_last(&window[..limit], start, database_uuid)
        {
            if closes_batch(space, inodes, found, &trailer, database_uuid)? {
                return Ok(Some(found));
            }
            warn!(
                target: "topiclog::recovery",
                end = found,
                "Skipping trailer-shaped bytes that do not close a batch"
            );
            limit = (found - start) as usize - 1;
        }
        if start == 0 {
            break;
        }
        // Overlap so a trailer straddling the window edge is seen
        end = start + TRAILER_SIZE as u64 - 1;
    }
    Ok(None)
}

/// Point directory entries past `durable` back at surviving inodes.
fn rewind_streams(
    space: &AddressSpace,
    inodes: &InodeStore,
    header: &mut Header,
    durable: u64,
    report: &mut RecoveryReport,
) -> Result<()> {
    let mut stale: FxHashMap<u32, String> = header
        .streams()
        .filter(|(_, e)| e.latest_inode.map_or(false, |addr| addr >= durable))
        .map(|(slot, e)| (slot as u32, e.name.clone()))
        .collect();
    if stale.is_empty() {
        return Ok(());
    }

    let geometry = *inodes.geometry();
    let database_uuid = header.database_uuid;
    let mut end = durable;
    while !stale.is_empty() && end > 0 {
        let trailer = trailer_at(space, end, &database_uuid)?.ok_or_else(|| {
            DurabilityError::corruption(format!("no batch trailer ends at {}", end))
        })?;

        let area_len = (end - TRAILER_SIZE as u64 - trailer.inode_area_start) as usize;
        let mut area = vec![0u8; area_len];
        space.read_exact_at(&mut area, trailer.inode_area_start)?;

        // Inodes are written oldest first, so the last one per stream wins
        let mut newest: FxHashMap<u32, u64> = FxHashMap::default();
        let mut pos = 0usize;
        for _ in 0..trailer.inode_count {
            let addr = trailer.inode_area_start + pos as u64;
            let (inode, used) = Inode::decode(&area[pos..], addr, &geometry)?;
            newest.insert(inode.stream_slot, addr);
            pos += used;
        }

        for (slot, addr) in newest {
            if let Some(name) = stale.remove(&slot) {
                set_latest(header, slot, Some(addr));
                report.streams_rewound.push(name);
            }
        }
        report.batches_scanned += 1;
        end = trailer.batch_start;
    }

    for (slot, name) in stale {
        set_latest(header, slot, None);
        report.streams_rewound.push(name);
    }
    report.streams_rewound.sort();

    for name in &report.streams_rewound {
        warn!(target: "topiclog::recovery", stream = %name, "Rewound stream to last committed batch");
    }
    Ok(())
}

fn set_latest(header: &mut Header, slot: u32, addr: Option<u64>) {
    if let Some(Some(entry)) = header.directory.get_mut(slot as usize) {
        entry.latest_inode = addr;
    }
}
