//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use tempfile::TempDir;
pub use topiclog::{
    Engine, EngineConfig, EngineError, Geometry, PendingRead, Record, Reply, RECORD_HEADER_SIZE,
};
use topiclog_storage::{shard_file_name, BatchTrailer, HeaderStore, TRAILER_SIZE};

/// Generous bound for reads that must resolve.
pub const WAIT: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

/// Install a warn-level test subscriber once.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing_subscriber::filter::LevelFilter::WARN)
            .try_init();
    });
}

/// Small blocks so a few records already span several inodes.
pub fn small_geometry() -> Geometry {
    Geometry::new(64, 4).unwrap()
}

/// Engine in a scratch directory that can be closed and reopened.
pub struct TestEngine {
    pub dir: TempDir,
    pub config: EngineConfig,
    pub engine: Option<Engine>,
}

impl TestEngine {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::for_testing(dir.path()).with_geometry(small_geometry());
        Self::with_config(dir, config)
    }

    pub fn with_config(dir: TempDir, config: EngineConfig) -> Self {
        init_tracing();
        let engine = Engine::open(config.clone()).unwrap();
        TestEngine {
            dir,
            config,
            engine: Some(engine),
        }
    }

    pub fn engine(&self) -> &Engine {
        self.engine.as_ref().unwrap()
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Close the engine and release the directory.
    pub fn close(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.close().unwrap();
        }
    }

    /// Close, then open the same directory again.
    pub fn reopen(&mut self) {
        self.close();
        self.engine = Some(Engine::open(self.config.clone()).unwrap());
    }

    /// Path of the shard file holding physical offset `pos`.
    pub fn shard_path_for(&self, pos: u64) -> PathBuf {
        let shard = pos >> self.config.shard_bit;
        self.path().join(shard_file_name(shard))
    }

    /// Read `len` physical bytes at `pos`, within one shard.
    pub fn read_physical(&self, pos: u64, len: usize) -> Vec<u8> {
        let bytes = fs::read(self.shard_path_for(pos)).unwrap();
        let local = (pos & (self.config.shard_size() - 1)) as usize;
        bytes[local..local + len].to_vec()
    }

    /// Cut the address space at physical offset `pos`.
    pub fn truncate_physical(&self, pos: u64) {
        let local = pos & (self.config.shard_size() - 1);
        let file = OpenOptions::new()
            .write(true)
            .open(self.shard_path_for(pos))
            .unwrap();
        file.set_len(local).unwrap();
        file.sync_all().unwrap();

        // Later shards are gone too
        let mut next = (pos >> self.config.shard_bit) + 1;
        loop {
            let path = self.path().join(shard_file_name(next));
            if !path.exists() {
                break;
            }
            fs::remove_file(path).unwrap();
            next += 1;
        }
    }

    /// Uuid recorded in the database header.
    pub fn database_uuid(&self) -> [u8; 16] {
        HeaderStore::new(self.path()).load().unwrap().database_uuid
    }

    /// Trailer of the batch ending at `end`.
    pub fn trailer_at(&self, end: u64) -> BatchTrailer {
        let raw = self.read_physical(end - TRAILER_SIZE as u64, TRAILER_SIZE);
        BatchTrailer::parse_at(&raw, end, &self.database_uuid()).expect("batch trailer")
    }

    /// Overwrite every occurrence of `needle` in the shard files.
    pub fn corrupt_everywhere(&self, needle: &[u8], with: u8) -> usize {
        let mut hits = 0;
        for entry in fs::read_dir(self.path()).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if name.starts_with('.') || name.starts_with("HEADER") {
                continue;
            }
            let mut bytes = fs::read(&path).unwrap();
            let mut at = 0;
            while let Some(i) = find(&bytes[at..], needle) {
                let start = at + i;
                bytes[start..start + needle.len()].fill(with);
                at = start + needle.len();
                hits += 1;
            }
            fs::write(&path, bytes).unwrap();
        }
        hits
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Encoded size of a record with a `len`-byte payload.
pub fn encoded(len: usize) -> u64 {
    (RECORD_HEADER_SIZE + len) as u64
}

/// Payloads of a reply.
pub fn payloads(reply: &Reply) -> Vec<Vec<u8>> {
    reply.records.iter().map(|r| r.payload.clone()).collect()
}

/// Resolve a read that must complete.
pub fn resolve(pending: PendingRead) -> Reply {
    pending
        .wait_timeout(WAIT)
        .expect("read did not resolve")
        .unwrap()
}
