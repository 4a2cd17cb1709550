//! Chunked address space over fixed-size shard files.
//!
//! The logical address space is unbounded; shard `i` is the file holding
//! bytes `[i << bit, (i + 1) << bit)`. Shard files are named by their index
//! in base 36 (`0`, `1`, ..., `z`, `10`, ...).
//!
//! # Handle Cache
//!
//! Open handles live in a fixed slot table indexed by `shard % SHARD_SLOTS`.
//! Handles are `Arc<File>`: a caller holds its own clone for the duration of
//! a positional read or write, so the table mutex is only held for lookup.
//! Opening a shard into an occupied slot replaces the table's clone; the old
//! file is closed when the last in-flight user drops its clone.

use crate::error::StorageError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use topiclog_core::Metrics;
use tracing::debug;

/// Number of slots in the shard handle cache.
pub const SHARD_SLOTS: usize = 16;

/// Largest addressable byte (exclusive).
const MAX_ADDRESS: u64 = i64::MAX as u64;

struct ShardSlot {
    shard: u64,
    file: Arc<File>,
}

/// One `read_at`/`write_at` surface spanning many shard files.
pub struct AddressSpace {
    /// Directory holding the shard files
    dir: PathBuf,

    /// Shard size is `1 << bit`
    bit: u32,

    /// Handle cache
    slots: Mutex<Vec<Option<ShardSlot>>>,

    /// Set by `close()`
    closed: AtomicBool,

    metrics: Arc<Metrics>,
}

impl AddressSpace {
    /// Open the address space rooted at `dir`, creating the directory.
    pub fn open(dir: &Path, bit: u32, metrics: Arc<Metrics>) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let mut slots = Vec::with_capacity(SHARD_SLOTS);
        slots.resize_with(SHARD_SLOTS, || None);

        Ok(AddressSpace {
            dir: dir.to_path_buf(),
            bit,
            slots: Mutex::new(slots),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Shard size in bytes.
    pub fn shard_size(&self) -> u64 {
        1u64 << self.bit
    }

    /// Shard bit.
    pub fn shard_bit(&self) -> u32 {
        self.bit
    }

    /// Directory holding the shard files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a shard file.
    pub fn shard_path(&self, shard: u64) -> PathBuf {
        self.dir.join(shard_file_name(shard))
    }

    /// Read into `buf` starting at `off`.
    ///
    /// Returns the number of bytes read, which is short only when the read
    /// runs past the last byte present on disk.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize, StorageError> {
        self.check_range(off, buf.len())?;

        let mut done = 0usize;
        while done < buf.len() {
            let pos = off + done as u64;
            let (shard, local, room) = self.split(pos);
            let want = room.min((buf.len() - done) as u64) as usize;

            let file = match self.acquire(shard, false)? {
                Some(file) => file,
                None => break,
            };
            let got = read_full_at(&file, &mut buf[done..done + want], local)?;
            done += got;
            if got < want {
                break;
            }
        }
        Ok(done)
    }

    /// Read exactly `buf.len()` bytes starting at `off`.
    pub fn read_exact_at(&self, buf: &mut [u8], off: u64) -> Result<(), StorageError> {
        let got = self.read_at(buf, off)?;
        if got < buf.len() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read {} of {} bytes at offset {}", got, buf.len(), off),
            )));
        }
        Ok(())
    }

    /// Write all of `buf` starting at `off`, splitting at shard boundaries.
    pub fn write_at(&self, buf: &[u8], off: u64) -> Result<(), StorageError> {
        self.check_range(off, buf.len())?;

        let mut done = 0usize;
        while done < buf.len() {
            let pos = off + done as u64;
            let (shard, local, room) = self.split(pos);
            let want = room.min((buf.len() - done) as u64) as usize;

            let file = self
                .acquire(shard, true)?
                .ok_or(StorageError::Closed)?;
            write_all_at(&file, &buf[done..done + want], local)?;
            done += want;
        }
        Ok(())
    }

    /// Sync every shard overlapping `[off, off + len)` to disk.
    pub fn sync_range(&self, off: u64, len: u64) -> Result<(), StorageError> {
        if len == 0 {
            return Ok(());
        }
        self.check_range(off, len as usize)?;

        let first = off >> self.bit;
        let last = (off + len - 1) >> self.bit;
        for shard in first..=last {
            if let Some(file) = self.acquire(shard, false)? {
                file.sync_data()?;
            }
        }
        Ok(())
    }

    /// One past the last byte present on disk.
    ///
    /// Computed from the highest-numbered shard file and its length.
    pub fn physical_end(&self) -> Result<u64, StorageError> {
        let mut highest: Option<u64> = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(shard) = parse_shard_file_name(&name) {
                highest = Some(highest.map_or(shard, |h: u64| h.max(shard)));
            }
        }

        match highest {
            Some(shard) => {
                let len = std::fs::metadata(self.shard_path(shard))?.len();
                Ok((shard << self.bit) + len)
            }
            None => Ok(0),
        }
    }

    /// Shards currently held in the handle cache, in slot order.
    pub fn cached_shards(&self) -> Vec<u64> {
        self.slots
            .lock()
            .iter()
            .filter_map(|slot| slot.as_ref().map(|s| s.shard))
            .collect()
    }

    /// Close the address space.
    ///
    /// Cached handles are released; subsequent operations fail with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// (shard, offset within shard, bytes left in shard) for a position.
    fn split(&self, pos: u64) -> (u64, u64, u64) {
        let shard = pos >> self.bit;
        let local = pos & (self.shard_size() - 1);
        (shard, local, self.shard_size() - local)
    }

    fn check_range(&self, off: u64, len: usize) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        match off.checked_add(len as u64) {
            Some(end) if end <= MAX_ADDRESS => Ok(()),
            _ => Err(StorageError::InvalidOffset { offset: off, len }),
        }
    }

    /// Get a handle for `shard`, opening it on a cache miss.
    ///
    /// With `create == false`, a missing shard file yields `Ok(None)`.
    fn acquire(&self, shard: u64, create: bool) -> Result<Option<Arc<File>>, StorageError> {
        let mut slots = self.slots.lock();
        if self.is_closed() {
            return Err(StorageError::Closed);
        }

        let idx = (shard % SHARD_SLOTS as u64) as usize;
        if let Some(slot) = &slots[idx] {
            if slot.shard == shard {
                return Ok(Some(Arc::clone(&slot.file)));
            }
        }

        let path = self.shard_path(shard);
        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path);
        let file = match opened {
            Ok(file) => Arc::new(file),
            Err(e) if !create && e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::ShardOpenFailed {
                    shard,
                    path,
                    source,
                })
            }
        };

        Metrics::incr(&self.metrics.shard_opens);
        debug!(target: "topiclog::shard", shard, slot = idx, "Opened shard file");

        // The previous occupant's file closes once in-flight users drop it.
        slots[idx] = Some(ShardSlot {
            shard,
            file: Arc::clone(&file),
        });
        Ok(Some(file))
    }
}

/// Base-36 file name of a shard.
pub fn shard_file_name(shard: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if shard == 0 {
        return "0".to_string();
    }
    let mut n = shard;
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_shard_file_name(name: &str) -> Option<u64> {
    if name.is_empty() || name.len() > 13 {
        return None;
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
    {
        return None;
    }
    u64::from_str_radix(name, 36).ok()
}

fn read_full_at(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match pread(file, &mut buf[done..], off + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

fn write_all_at(file: &File, buf: &[u8], off: u64) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match pwrite(file, &buf[done..], off + done as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write shard bytes",
                ))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, off)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, off)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, off)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, off)
}
