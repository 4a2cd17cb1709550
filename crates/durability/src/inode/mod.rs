//! Stream inodes.
//!
//! - `address`: tagged in-memory/on-disk addresses and the inode arena
//! - `format`: inode structure and record encoding
//! - `store`: shared cache of durable inodes and skip-pointer lookup
//! - `chain`: per-stream write position and inode versioning

pub mod address;
pub mod chain;
pub mod format;
pub mod store;

pub use address::{Address, InodeArena, InodeHandle};
pub use chain::{BlockRef, InodeChain};
pub use format::{Inode, INODE_FORMAT_VERSION, SKIP_LEVELS};
pub use store::{InodeStore, Located, INODE_CACHE_CAPACITY};
