//! The open-file handle table: a fixed-size array of slots handed out by `open`/`create` and
//! freed by `release`.
//!
//! Kept as a plain `Vec`-backed table owned by [`crate::fs::FileSystem`] rather than a global,
//! per §9's required re-architecture ("a single file system value owned by the host-integration
//! layer"); the source's array-of-structs shape is otherwise unchanged.

use crate::error::{FsError, Result};

/// Default capacity of the open-file table.
pub const NUM_OPEN_FILES: usize = 128;

/// One open-file slot.
#[derive(Debug, Clone, Copy)]
struct Handle {
    in_use: bool,
    inode_id: u32,
    flags: i32,
}

/// The open-file table. A handle id is its slot index, stable for the life of the open file.
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Handle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: vec![
                Handle {
                    in_use: false,
                    inode_id: 0,
                    flags: 0,
                };
                NUM_OPEN_FILES
            ],
        }
    }

    /// Allocates the first free slot for `inode_id`/`flags`, returning its handle id.
    pub fn allocate(&mut self, inode_id: u32, flags: i32) -> Result<u64> {
        let slot = self.slots.iter().position(|h| !h.in_use).ok_or_else(|| {
            log::warn!("open file table exhausted ({} slots)", self.slots.len());
            FsError::TooManyOpenFiles
        })?;
        self.slots[slot] = Handle {
            in_use: true,
            inode_id,
            flags,
        };
        Ok(slot as u64)
    }

    /// Returns the inode backing an open handle.
    pub fn inode_id(&self, handle: u64) -> Result<u32> {
        self.slot(handle).map(|h| h.inode_id)
    }

    /// Frees a handle slot. A no-op if the handle is already free or out of range, since
    /// `release` on an already-released handle should not itself fail the host dispatch.
    pub fn release(&mut self, handle: u64) {
        if let Some(h) = self.slots.get_mut(handle as usize) {
            *h = Handle {
                in_use: false,
                inode_id: 0,
                flags: 0,
            };
        }
    }

    fn slot(&self, handle: u64) -> Result<&Handle> {
        self.slots
            .get(handle as usize)
            .filter(|h| h.in_use)
            .ok_or(FsError::InvalidPath)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_then_release_reuses_slot() {
        let mut t = HandleTable::new();
        let h = t.allocate(3, 0).unwrap();
        assert_eq!(t.inode_id(h).unwrap(), 3);
        t.release(h);
        let h2 = t.allocate(4, 0).unwrap();
        assert_eq!(h2, h);
    }

    #[test]
    fn exhaustion_reports_too_many_open_files() {
        let mut t = HandleTable::new();
        for _ in 0..NUM_OPEN_FILES {
            t.allocate(0, 0).unwrap();
        }
        assert!(matches!(t.allocate(0, 0), Err(FsError::TooManyOpenFiles)));
    }
}
