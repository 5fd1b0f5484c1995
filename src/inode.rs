//! Inode records: layout, and allocate/free/read/write against the inode table.
//!
//! The address arithmetic mirrors `llenotre-maestro`'s ext2 driver (`INode::get_disk_offset`)
//! collapsed to this format's single inode table instead of ext2's per-block-group tables: an
//! inode's offset is just `first_inode_block * BLOCK_SIZE + id * INODE_SIZE`.

use std::mem::size_of;
use std::slice;

use crate::block::BlockDevice;
use crate::error::{FsError, Result};
use crate::superblock::{Superblock, BLOCK_SIZE};
use crate::util::timestamp_secs;

/// Inode flags: bit 0.
pub const FLAG_IN_USE: u32 = 1 << 0;
/// Inode flags: bits 1-2, the type field.
const FLAG_TYPE_MASK: u32 = 0b110;
const FLAG_TYPE_SHIFT: u32 = 1;

/// Number of direct block slots in an inode (indices 0..12).
pub const DIRECT_BLOCKS: usize = 12;
/// Index of the single-indirect block slot.
pub const SINGLE_INDIRECT: usize = 12;
/// Index of the double-indirect block slot.
pub const DOUBLE_INDIRECT: usize = 13;
/// Total number of block reference slots in an inode.
pub const NUM_BLOCK_SLOTS: usize = 14;

/// The inode id of the root directory; always present after format.
pub const ROOT_INODE: u32 = 0;

/// What an inode describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    File,
    Dir,
}

impl InodeType {
    fn to_bits(self) -> u32 {
        match self {
            InodeType::File => 1,
            InodeType::Dir => 2,
        }
    }

    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(InodeType::File),
            2 => Some(InodeType::Dir),
            _ => None,
        }
    }
}

/// A fixed-size on-disk inode record.
// No `Debug`: deriving it on a packed multi-byte-field struct forms unaligned field references.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Inode {
    pub flags: u32,
    /// File: logical byte length. Directory: block-granular bookkeeping value, not user-visible.
    pub size: u64,
    /// Live directory entries; meaningless for files.
    pub child_count: u32,
    pub last_access: u32,
    pub last_modify: u32,
    pub last_change: u32,
    pub blocks: [u32; NUM_BLOCK_SLOTS],
}

/// Size of one inode record on disk; also the format parameter `INODE_SIZE`.
pub const INODE_SIZE: usize = size_of::<Inode>();

impl Inode {
    /// A zeroed, unused inode.
    fn empty() -> Self {
        Inode {
            flags: 0,
            size: 0,
            child_count: 0,
            last_access: 0,
            last_modify: 0,
            last_change: 0,
            blocks: [0; NUM_BLOCK_SLOTS],
        }
    }

    /// A freshly allocated inode of the given type, timestamped at "now".
    fn new(ty: InodeType) -> Self {
        let now = timestamp_secs();
        Inode {
            flags: FLAG_IN_USE | (ty.to_bits() << FLAG_TYPE_SHIFT),
            size: 0,
            child_count: 0,
            last_access: now,
            last_modify: now,
            last_change: now,
            blocks: [0; NUM_BLOCK_SLOTS],
        }
    }

    pub fn in_use(&self) -> bool {
        self.flags & FLAG_IN_USE != 0
    }

    pub fn inode_type(&self) -> Option<InodeType> {
        InodeType::from_bits((self.flags & FLAG_TYPE_MASK) >> FLAG_TYPE_SHIFT)
    }

    pub fn is_dir(&self) -> bool {
        self.inode_type() == Some(InodeType::Dir)
    }

    pub fn touch_modify(&mut self) {
        let now = timestamp_secs();
        self.last_modify = now;
        self.last_change = now;
    }

    pub fn touch_access(&mut self) {
        self.last_access = timestamp_secs();
    }
}

/// Block id and in-block byte offset of inode `id` within the backing image.
///
/// `INODE_SIZE` (84 bytes) does not evenly divide `BLOCK_SIZE`, so the inode table is laid out as
/// `inodes_per_block()` records per block with the remainder left as trailing padding, not as one
/// continuous byte stream — otherwise a record would periodically straddle a block boundary and
/// any read/write that only touches one block would have to slice past its end.
fn disk_location(id: u32, sb: &Superblock) -> (u32, usize) {
    let per_block = crate::superblock::inodes_per_block() as u64;
    let block = sb.first_inode_block as u64 + id as u64 / per_block;
    let in_block = (id as u64 % per_block) as usize * INODE_SIZE;
    (block as u32, in_block)
}

/// Reads inode `id`.
pub fn read_inode(dev: &mut BlockDevice, sb: &Superblock, id: u32) -> Result<Inode> {
    let (block, in_block) = disk_location(id, sb);
    let mut buf = [0u8; BLOCK_SIZE];
    dev.read_block(block, &mut buf)?;
    let mut inode = Inode::empty();
    let dst =
        unsafe { slice::from_raw_parts_mut(&mut inode as *mut _ as *mut u8, INODE_SIZE) };
    dst.copy_from_slice(&buf[in_block..in_block + INODE_SIZE]);
    Ok(inode)
}

/// Writes inode `id`.
pub fn write_inode(dev: &mut BlockDevice, sb: &Superblock, id: u32, inode: &Inode) -> Result<()> {
    let (block, in_block) = disk_location(id, sb);
    let mut buf = [0u8; BLOCK_SIZE];
    dev.read_block(block, &mut buf)?;
    let src = unsafe { slice::from_raw_parts(inode as *const _ as *const u8, INODE_SIZE) };
    buf[in_block..in_block + INODE_SIZE].copy_from_slice(src);
    dev.write_block(block, &buf)?;
    Ok(())
}

/// Scans the inode table for the first free slot, marks it in use, persists it and the
/// superblock's `num_free_inodes`, and returns both the id and the freshly written record.
pub fn allocate_inode(
    dev: &mut BlockDevice,
    sb: &mut Superblock,
    ty: InodeType,
) -> Result<(u32, Inode)> {
    for id in 0..sb.num_inodes {
        let existing = read_inode(dev, sb, id)?;
        if !existing.in_use() {
            let inode = Inode::new(ty);
            write_inode(dev, sb, id, &inode)?;
            sb.num_free_inodes -= 1;
            sb.write(dev)?;
            return Ok((id, inode));
        }
    }
    log::warn!("inode table exhausted ({} inodes)", sb.num_inodes);
    Err(FsError::NoSpace)
}

/// Zeroes and frees inode `id`.
pub fn free_inode(dev: &mut BlockDevice, sb: &mut Superblock, id: u32) -> Result<()> {
    write_inode(dev, sb, id, &Inode::empty())?;
    sb.num_free_inodes += 1;
    sb.write(dev)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write as _;

    fn fresh_device() -> (tempfile::TempPath, BlockDevice, Superblock) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        let sb = Superblock::new_formatted();
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            let zeros = vec![0u8; sb.num_blocks as usize * BLOCK_SIZE];
            f.write_all(&zeros).unwrap();
        }
        let mut dev = BlockDevice::open(&path).unwrap();
        sb.write(&mut dev).unwrap();
        (file.into_temp_path(), dev, sb)
    }

    #[test]
    fn allocate_past_first_inode_block_boundary() {
        let (_guard, mut dev, mut sb) = fresh_device();
        let per_block = crate::superblock::inodes_per_block();
        // One past the first inode-table block's record count, so the allocator's linear scan and
        // the final allocation both touch a record that starts in the table's second block.
        let mut last = None;
        for _ in 0..(per_block + 1) {
            last = Some(allocate_inode(&mut dev, &mut sb, InodeType::File).unwrap());
        }
        let (id, _) = last.unwrap();
        let mut inode = read_inode(&mut dev, &sb, id).unwrap();
        inode.touch_modify();
        write_inode(&mut dev, &sb, id, &inode).unwrap();
        assert!(read_inode(&mut dev, &sb, id).unwrap().in_use());
    }
}
