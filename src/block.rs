//! Positioned whole-block read/write against the backing image.
//!
//! There is no caching layer above this: every call is a direct `seek` + `read_exact`/`write_all`
//! against the underlying [`File`], relying on the host's own buffered I/O rather than adding a
//! second one here (the same division of labor `mkfs/src/ext2.rs` makes against its device file).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::superblock::BLOCK_SIZE;

/// A block id, i.e. an index of a `BLOCK_SIZE`-byte block within the backing image.
pub type BlockId = u32;

/// The backing image, addressed in whole blocks.
#[derive(Debug)]
pub struct BlockDevice {
    file: File,
}

impl BlockDevice {
    /// Opens the backing image at `path` for reading and writing.
    ///
    /// The file is not created: the image must already exist with its final size, since the core
    /// never grows it (see the spec's "growth of the backing image after format" non-goal).
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Reads block `id` into `buf`.
    pub fn read_block(&mut self, id: BlockId, buf: &mut [u8; BLOCK_SIZE]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(Self::offset(id)))?;
        self.file.read_exact(buf)
    }

    /// Writes `buf` to block `id` and flushes it to the backing image before returning.
    pub fn write_block(&mut self, id: BlockId, buf: &[u8; BLOCK_SIZE]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(Self::offset(id)))?;
        self.file.write_all(buf)?;
        self.file.sync_data()
    }

    /// Returns the byte offset of block `id` in the backing image.
    fn offset(id: BlockId) -> u64 {
        id as u64 * BLOCK_SIZE as u64
    }
}
