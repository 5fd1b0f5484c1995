//! The block bitmap: one bit per block, kept resident in memory for the life of the mount and
//! rewritten whole on every allocation/deallocation.
//!
//! The set-a-bit/clear-a-bit arithmetic below is the same byte/bit split `mkfs/src/ext2.rs`'s
//! `fill_bitmap` uses to pre-mark ext2's metadata blocks; this format just keeps the whole thing
//! in one block instead of one block per group.

use crate::block::BlockDevice;
use crate::error::Result;
use crate::superblock::{Superblock, BLOCK_SIZE};

/// The in-memory mirror of the bitmap block.
#[derive(Debug, Clone)]
pub struct Bitmap {
    bits: [u8; BLOCK_SIZE],
}

impl Bitmap {
    /// Loads the bitmap block from the image.
    pub fn load(dev: &mut BlockDevice, sb: &Superblock) -> Result<Self> {
        let mut bits = [0u8; BLOCK_SIZE];
        dev.read_block(sb.bitmap_block, &mut bits)?;
        Ok(Self { bits })
    }

    /// Builds the all-zero bitmap for a freshly formatted image; blocks `[0, first_data_block]`
    /// (inclusive of the bitmap block itself) are then marked used by the caller.
    pub fn new_empty() -> Self {
        Self {
            bits: [0u8; BLOCK_SIZE],
        }
    }

    fn is_set(&self, id: u32) -> bool {
        let (byte, bit) = (id as usize / 8, id as usize % 8);
        self.bits[byte] & (1 << bit) != 0
    }

    fn set(&mut self, id: u32) {
        let (byte, bit) = (id as usize / 8, id as usize % 8);
        self.bits[byte] |= 1 << bit;
    }

    fn clear(&mut self, id: u32) {
        let (byte, bit) = (id as usize / 8, id as usize % 8);
        self.bits[byte] &= !(1 << bit);
    }

    fn persist(&self, dev: &mut BlockDevice, sb: &Superblock) -> Result<()> {
        dev.write_block(sb.bitmap_block, &self.bits)?;
        Ok(())
    }

    /// Marks block `id` used without touching `num_free_blocks`; used only at format time to
    /// reserve the metadata region, whose blocks are never counted as "free" to begin with.
    pub fn mark_used_unaccounted(&mut self, id: u32) {
        self.set(id);
    }

    /// Writes the resident bitmap to disk without touching any counter; used once at format time
    /// after the metadata region has been marked used, before the allocator's own persisting
    /// calls take over.
    pub fn flush(&self, dev: &mut BlockDevice, sb: &Superblock) -> Result<()> {
        self.persist(dev, sb)
    }

    /// Finds the lowest-indexed free block, marks it used, persists the bitmap and the
    /// superblock's `num_free_blocks`, and returns its id. Returns [`crate::error::FsError::NoSpace`]
    /// on exhaustion.
    pub fn allocate_next_block(
        &mut self,
        dev: &mut BlockDevice,
        sb: &mut Superblock,
    ) -> Result<u32> {
        for id in 0..sb.num_blocks {
            if !self.is_set(id) {
                self.set(id);
                sb.num_free_blocks -= 1;
                self.persist(dev, sb)?;
                sb.write(dev)?;
                return Ok(id);
            }
        }
        log::warn!("block bitmap exhausted ({} blocks)", sb.num_blocks);
        Err(crate::error::FsError::NoSpace)
    }

    /// Frees block `id`. A no-op for any block in the protected metadata region
    /// (`id < sb.first_data_block`), since those blocks may never be returned to the pool.
    pub fn mark_block_free(
        &mut self,
        dev: &mut BlockDevice,
        sb: &mut Superblock,
        id: u32,
    ) -> Result<()> {
        if id == 0 || id < sb.first_data_block {
            return Ok(());
        }
        if self.is_set(id) {
            self.clear(id);
            sb.num_free_blocks += 1;
            self.persist(dev, sb)?;
            sb.write(dev)?;
        }
        Ok(())
    }

    /// Number of zero bits, i.e. what `num_free_blocks` must equal after every operation.
    #[cfg(test)]
    pub fn count_free(&self, total_blocks: u32) -> u32 {
        (0..total_blocks).filter(|&id| !self.is_set(id)).count() as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_clear_roundtrip() {
        let mut bm = Bitmap::new_empty();
        assert!(!bm.is_set(10));
        bm.set(10);
        assert!(bm.is_set(10));
        bm.clear(10);
        assert!(!bm.is_set(10));
    }
}
