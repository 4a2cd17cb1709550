//! Inode addresses and the arena owning unflushed inode versions.
//!
//! An inode version is addressed either by its arena handle, while it only
//! exists in memory, or by the physical offset it was written at. The
//! transition happens exactly once per version, when its batch is flushed.

use super::format::Inode;
use std::fmt;

/// Generational handle into an [`InodeArena`].
///
/// A handle whose slot was freed and reused no longer resolves, so a stale
/// handle can never alias a newer inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for InodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Location of one inode version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Not yet flushed; owned by the arena
    InMemory(InodeHandle),
    /// Written at this physical offset
    OnDisk(u64),
}

impl Address {
    /// Physical offset, if the version is on disk.
    pub fn on_disk(&self) -> Option<u64> {
        match self {
            Address::OnDisk(addr) => Some(*addr),
            Address::InMemory(_) => None,
        }
    }

    /// Whether the version has been flushed.
    pub fn is_durable(&self) -> bool {
        matches!(self, Address::OnDisk(_))
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Occupied { generation: u32, inode: Inode },
    Vacant { generation: u32 },
}

/// Generational arena of in-memory inode versions.
#[derive(Debug, Clone, Default)]
pub struct InodeArena {
    entries: Vec<Entry>,
    free: Vec<u32>,
    len: usize,
}

impl InodeArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `inode` and return its handle.
    pub fn insert(&mut self, inode: Inode) -> InodeHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.entries[index as usize];
            let generation = match slot {
                Entry::Vacant { generation } => generation.wrapping_add(1),
                Entry::Occupied { generation, .. } => generation.wrapping_add(1),
            };
            *slot = Entry::Occupied { generation, inode };
            return InodeHandle { index, generation };
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry::Occupied {
            generation: 0,
            inode,
        });
        InodeHandle {
            index,
            generation: 0,
        }
    }

    /// Inode behind `handle`, if it is still live.
    pub fn get(&self, handle: InodeHandle) -> Option<&Inode> {
        match self.entries.get(handle.index as usize)? {
            Entry::Occupied { generation, inode } if *generation == handle.generation => {
                Some(inode)
            }
            _ => None,
        }
    }

    /// Mutable inode behind `handle`, if it is still live.
    pub fn get_mut(&mut self, handle: InodeHandle) -> Option<&mut Inode> {
        match self.entries.get_mut(handle.index as usize)? {
            Entry::Occupied { generation, inode } if *generation == handle.generation => {
                Some(inode)
            }
            _ => None,
        }
    }

    /// Release `handle` and hand back its inode.
    pub fn remove(&mut self, handle: InodeHandle) -> Option<Inode> {
        self.get(handle)?;
        let vacant = Entry::Vacant {
            generation: handle.generation,
        };
        match std::mem::replace(&mut self.entries[handle.index as usize], vacant) {
            Entry::Occupied { inode, .. } => {
                self.free.push(handle.index);
                self.len -= 1;
                Some(inode)
            }
            Entry::Vacant { .. } => None,
        }
    }

    /// Number of live inodes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no inodes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
