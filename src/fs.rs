//! The file-op façade: ties the superblock, bitmap, inode table, indirection mapper, directory
//! entries, path resolver and handle table into the operations a host integration layer calls.
//!
//! Grounded on `llenotre-maestro`'s `ext2::Ext2Fs` (one struct owning the device plus every
//! on-disk subsystem, with one method per VFS-shaped operation) and on §9's required
//! re-architecture: the source's global backing-image handle, superblock, bitmap and handle table
//! become fields of a single value the caller owns, rather than module statics.

use std::path::Path;

use crate::bitmap::Bitmap;
use crate::block::BlockDevice;
use crate::dirent::{add_entry, find_entry, is_empty, list_entries, remove_entry};
use crate::error::{FsError, Result};
use crate::handle::HandleTable;
use crate::indirect::{
    assign_next_block, assign_next_dir_block, block_for_offset, free_all_blocks,
    free_all_dir_blocks,
};
use crate::inode::{allocate_inode, free_inode, read_inode, write_inode, Inode, InodeType, ROOT_INODE};
use crate::superblock::{Superblock, BLOCK_SIZE};

/// A stat-like attribute record handed back by `getattr`, deliberately shaped like the
/// conventional VFS attribute struct `fuser::FileAttr` mirrors, but independent of that crate so
/// the core has no dependency on the host integration layer.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub inode_id: u32,
    pub kind: InodeType,
    pub size: u64,
    /// `size / 512`, rounded up, per §4.8.
    pub blocks: u64,
    pub last_access: u32,
    pub last_modify: u32,
    pub last_change: u32,
    /// Always 1: hard links are a non-goal.
    pub nlink: u32,
    /// Always 0o777 bits for the type's kind; mode/ownership enforcement is a non-goal.
    pub perm: u16,
}

fn attr_of(inode_id: u32, inode: &Inode) -> Attr {
    let size = inode.size;
    Attr {
        inode_id,
        kind: inode.inode_type().expect("live inode has a type"),
        size,
        blocks: size / 512,
        last_access: inode.last_access,
        last_modify: inode.last_modify,
        last_change: inode.last_change,
        nlink: 1,
        perm: 0o777,
    }
}

/// A mounted image: owns the device handle and every piece of resident state the core needs
/// across calls (§5: all shared state lives here, not behind a lock — the caller must serialize).
pub struct FileSystem {
    dev: BlockDevice,
    sb: Superblock,
    bitmap: Bitmap,
    handles: HandleTable,
}

impl FileSystem {
    /// Mounts the backing image at `path`, formatting it first if its magic does not match.
    pub fn mount(path: &Path) -> Result<Self> {
        let mut dev = BlockDevice::open(path)?;
        let mut sb = Superblock::read(&mut dev)?;
        let mut bitmap;
        if !sb.is_formatted() {
            log::info!("magic mismatch on {path:?}, formatting");
            sb = Superblock::new_formatted();
            bitmap = Bitmap::new_empty();
            for id in 0..=sb.first_data_block {
                bitmap.mark_used_unaccounted(id);
            }
            sb.write(&mut dev)?;
            // Bitmap must exist on disk before `allocate_inode` below can persist the root's
            // first block through the normal allocator path.
            bitmap.flush(&mut dev, &sb)?;
        } else {
            bitmap = Bitmap::load(&mut dev, &sb)?;
        }

        if sb.num_inodes == sb.num_free_inodes {
            let (root_id, mut root) = allocate_inode(&mut dev, &mut sb, InodeType::Dir)?;
            debug_assert_eq!(root_id, ROOT_INODE);
            let first_block = assign_next_dir_block(&mut dev, &mut sb, &mut bitmap, &mut root)?;
            dev.write_block(first_block, &[0u8; BLOCK_SIZE])?;
            root.size = BLOCK_SIZE as u64;
            write_inode(&mut dev, &sb, root_id, &root)?;
        }

        Ok(Self {
            dev,
            sb,
            bitmap,
            handles: HandleTable::new(),
        })
    }

    /// Resolves `path` and returns its attribute record.
    pub fn getattr(&mut self, path: &str) -> Result<Attr> {
        let (id, inode) = crate::path::resolve(&mut self.dev, &self.sb, path)?;
        Ok(attr_of(id, &inode))
    }

    /// Creates a regular file at `path` and opens it, returning its attributes and a handle.
    ///
    /// Per §4.8: if the file already exists, this succeeds as an open rather than failing with
    /// `AlreadyExists` (the create path and the open path converge on an existing name).
    pub fn create(&mut self, path: &str) -> Result<(Attr, u64)> {
        if let Ok((id, inode)) = crate::path::resolve(&mut self.dev, &self.sb, path) {
            let handle = self.handles.allocate(id, 0)?;
            return Ok((attr_of(id, &inode), handle));
        }

        let (parent_id, mut parent, name) =
            crate::path::resolve_parent(&mut self.dev, &self.sb, path)?;
        if find_entry(&mut self.dev, &parent, name)?.is_some() {
            log::debug!("create({path}): already exists");
            return Err(FsError::AlreadyExists);
        }
        parent.touch_modify();

        let (child_id, child) = allocate_inode(&mut self.dev, &mut self.sb, InodeType::File)?;
        if let Err(e) = self.link_entry(&mut parent, name, child_id) {
            free_inode(&mut self.dev, &mut self.sb, child_id)?;
            return Err(e);
        }
        write_inode(&mut self.dev, &self.sb, parent_id, &parent)?;

        let handle = self.handles.allocate(child_id, 0)?;
        Ok((attr_of(child_id, &child), handle))
    }

    /// Creates an empty directory at `path`. No `.`/`..` entries are created (§4.8).
    pub fn mkdir(&mut self, path: &str) -> Result<Attr> {
        if crate::path::resolve(&mut self.dev, &self.sb, path).is_ok() {
            log::debug!("mkdir({path}): already exists");
            return Err(FsError::AlreadyExists);
        }
        let (parent_id, mut parent, name) =
            crate::path::resolve_parent(&mut self.dev, &self.sb, path)?;
        parent.touch_modify();

        let (child_id, child) = allocate_inode(&mut self.dev, &mut self.sb, InodeType::Dir)?;
        if let Err(e) = self.link_entry(&mut parent, name, child_id) {
            free_inode(&mut self.dev, &mut self.sb, child_id)?;
            return Err(e);
        }
        write_inode(&mut self.dev, &self.sb, parent_id, &parent)?;
        Ok(attr_of(child_id, &child))
    }

    /// Opens `path`, allocating a handle. Fails with [`FsError::TooManyOpenFiles`] when the
    /// handle table is full.
    pub fn open(&mut self, path: &str, flags: i32) -> Result<u64> {
        let (id, _inode) = crate::path::resolve(&mut self.dev, &self.sb, path)?;
        self.handles.allocate(id, flags)
    }

    /// Frees an open-file handle.
    pub fn release(&mut self, handle: u64) {
        self.handles.release(handle);
    }

    /// Reads up to `size` bytes starting at `offset` from the file open as `handle`, per the
    /// byte-window loop of §4.8. Returns fewer than `size` bytes only at end-of-file.
    pub fn read(&mut self, handle: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let inode_id = self.handles.inode_id(handle)?;
        let mut inode = read_inode(&mut self.dev, &self.sb, inode_id)?;
        if offset >= inode.size {
            return Ok(Vec::new());
        }
        let clamped = size as u64;
        let remaining = inode.size - offset;
        let to_read = clamped.min(remaining) as usize;

        let mut out = Vec::with_capacity(to_read);
        let mut pos = offset;
        while out.len() < to_read {
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let want = (to_read - out.len()).min(BLOCK_SIZE - in_block);
            let block_id = block_for_offset(&mut self.dev, &inode, pos)?;
            if block_id == 0 {
                out.extend(std::iter::repeat(0u8).take(want));
            } else {
                let mut buf = [0u8; BLOCK_SIZE];
                self.dev.read_block(block_id, &mut buf)?;
                out.extend_from_slice(&buf[in_block..in_block + want]);
            }
            pos += want as u64;
        }

        inode.touch_access();
        write_inode(&mut self.dev, &self.sb, inode_id, &inode)?;
        Ok(out)
    }

    /// Writes `data` at `offset` into the file open as `handle`, allocating blocks on demand
    /// (read-modify-write to preserve unrelated bytes within a partially-written block).
    ///
    /// §9 flags the source's `size = size + written` as a bug for writes past EOF; this instead
    /// tracks `size = max(size, offset + written)`.
    pub fn write(&mut self, handle: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let inode_id = self.handles.inode_id(handle)?;
        let mut inode = read_inode(&mut self.dev, &self.sb, inode_id)?;

        let mut pos = offset;
        let mut written = 0usize;
        while written < data.len() {
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let want = (data.len() - written).min(BLOCK_SIZE - in_block);

            let mut block_id = block_for_offset(&mut self.dev, &inode, pos)?;
            if block_id == 0 {
                block_id = assign_next_block(&mut self.dev, &mut self.sb, &mut self.bitmap, inode_id, &mut inode)?;
            }

            let mut buf = [0u8; BLOCK_SIZE];
            self.dev.read_block(block_id, &mut buf)?;
            buf[in_block..in_block + want].copy_from_slice(&data[written..written + want]);
            self.dev.write_block(block_id, &buf)?;

            written += want;
            pos += want as u64;
        }

        inode.size = inode.size.max(offset + data.len() as u64);
        inode.touch_modify();
        write_inode(&mut self.dev, &self.sb, inode_id, &inode)?;
        Ok(written as u32)
    }

    /// Resolves `path` and lists its entries, invoking `filler(name, inode_id)` for each. Stops
    /// and reports [`FsError::NoSpace`] the first time `filler` returns `false` ("out of memory"
    /// per §4.8's readdir row, signaled through the same taxonomy as allocation exhaustion).
    pub fn readdir(&mut self, path: &str, mut filler: impl FnMut(&str, u32) -> bool) -> Result<()> {
        let (_id, dir) = crate::path::resolve(&mut self.dev, &self.sb, path)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        for (name, inode_id) in list_entries(&mut self.dev, &dir)? {
            if !filler(&name, inode_id) {
                log::debug!("readdir({path}): filler reported out of memory");
                return Err(FsError::NoSpace);
            }
        }
        Ok(())
    }

    /// Removes the file at `path`, freeing every block its indirection chain reaches.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let (id, mut inode) = crate::path::resolve(&mut self.dev, &self.sb, path)?;
        if inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let (parent_id, mut parent, name) =
            crate::path::resolve_parent(&mut self.dev, &self.sb, path)?;

        free_all_blocks(&mut self.dev, &mut self.sb, &mut self.bitmap, &mut inode)?;
        free_inode(&mut self.dev, &mut self.sb, id)?;

        remove_entry(&mut self.dev, &parent, name)?;
        parent.child_count -= 1;
        parent.touch_modify();
        write_inode(&mut self.dev, &self.sb, parent_id, &parent)?;
        Ok(())
    }

    /// Removes the empty directory at `path`.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let (id, mut inode) = crate::path::resolve(&mut self.dev, &self.sb, path)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if !is_empty(&mut self.dev, &inode)? {
            log::debug!("rmdir({path}): not empty");
            return Err(FsError::NotEmpty);
        }
        let (parent_id, mut parent, name) =
            crate::path::resolve_parent(&mut self.dev, &self.sb, path)?;

        free_all_dir_blocks(&mut self.dev, &mut self.sb, &mut self.bitmap, &mut inode)?;
        free_inode(&mut self.dev, &mut self.sb, id)?;

        remove_entry(&mut self.dev, &parent, name)?;
        parent.child_count -= 1;
        parent.touch_modify();
        write_inode(&mut self.dev, &self.sb, parent_id, &parent)?;
        Ok(())
    }

    /// Links `name -> child_id` at `parent`'s positional slot `child_count`, allocating the block
    /// that slot falls in first if it isn't allocated yet. Directories use all 14 block slots as
    /// direct references with no indirection (§4.3), so capacity exhaustion past
    /// [`crate::dirent::MAX_ENTRIES`] is permanent, not a transient "allocate another level"
    /// situation.
    fn link_entry(&mut self, parent: &mut Inode, name: &str, child_id: u32) -> Result<()> {
        if parent.child_count as usize >= crate::dirent::MAX_ENTRIES {
            log::warn!("directory entry capacity exhausted ({} entries)", crate::dirent::MAX_ENTRIES);
            return Err(FsError::NoSpace);
        }
        let target_block = parent.child_count as usize / crate::dirent::ENTRIES_PER_BLOCK;
        if parent.blocks[target_block] == 0 {
            // `child_count < MAX_ENTRIES` (checked above) guarantees `target_block < DIR_BLOCKS`,
            // so this can only fail if the directory's blocks were filled out of order.
            let block = match assign_next_dir_block(&mut self.dev, &mut self.sb, &mut self.bitmap, parent) {
                Ok(block) => block,
                Err(e) => {
                    log::warn!("directory has no free direct block slot for a new entry block");
                    return Err(e);
                }
            };
            self.dev.write_block(block, &[0u8; BLOCK_SIZE])?;
            parent.size += BLOCK_SIZE as u64;
        }
        add_entry(&mut self.dev, parent, name, child_id)?;
        parent.child_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write as _;

    fn fresh_image() -> (tempfile::TempPath, std::path::PathBuf) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            let zeros = vec![0u8; Superblock::new_formatted().num_blocks as usize * BLOCK_SIZE];
            f.write_all(&zeros).unwrap();
        }
        (file.into_temp_path(), path)
    }

    #[test]
    fn format_then_remount_preserves_root() {
        let (_guard, path) = fresh_image();
        {
            let fs = FileSystem::mount(&path).unwrap();
            let magic = fs.sb.magic;
            assert_eq!(magic, crate::superblock::MAGIC);
        }
        let mut fs = FileSystem::mount(&path).unwrap();
        let attr = fs.getattr("/").unwrap();
        assert_eq!(attr.inode_id, ROOT_INODE);
        assert_eq!(attr.kind, InodeType::Dir);
    }

    #[test]
    fn mkdir_and_create_then_lookup() {
        let (_guard, path) = fresh_image();
        let mut fs = FileSystem::mount(&path).unwrap();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        let (_attr, handle) = fs.create("/a/b/c.txt").unwrap();
        fs.release(handle);

        let (_id, inode) = crate::path::resolve(&mut fs.dev, &fs.sb, "/a/b/c.txt").unwrap();
        assert!(!inode.is_dir());
        let (_parent_id, parent) = crate::path::resolve(&mut fs.dev, &fs.sb, "/a/b").unwrap();
        assert_eq!({ parent.child_count }, 1);
    }

    #[test]
    fn mkdir_twice_fails_with_already_exists() {
        let (_guard, path) = fresh_image();
        let mut fs = FileSystem::mount(&path).unwrap();
        fs.mkdir("/a").unwrap();
        assert!(matches!(fs.mkdir("/a"), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn write_then_read_direct_blocks_roundtrip() {
        let (_guard, path) = fresh_image();
        let mut fs = FileSystem::mount(&path).unwrap();
        let (_attr, handle) = fs.create("/f").unwrap();
        let data = vec![b'A'; 100_000];
        let n = fs.write(handle, 0, &data).unwrap();
        assert_eq!(n as usize, data.len());

        let read_back = fs.read(handle, 0, data.len() as u32).unwrap();
        assert_eq!(read_back, data);

        let attr = fs.getattr("/f").unwrap();
        assert_eq!(attr.size, data.len() as u64);
    }

    #[test]
    fn write_past_single_indirect_boundary() {
        let (_guard, path) = fresh_image();
        let mut fs = FileSystem::mount(&path).unwrap();
        let (_attr, handle) = fs.create("/big").unwrap();

        // `assign_next_block` fills holes strictly left to right, so the single-indirect block
        // is only reached once every direct slot is already occupied (§4.5); fill them first in
        // one contiguous write, exactly as a real append-only writer would.
        let direct_capacity = crate::inode::DIRECT_BLOCKS * BLOCK_SIZE;
        fs.write(handle, 0, &vec![0u8; direct_capacity]).unwrap();

        let offset = direct_capacity as u64;
        fs.write(handle, offset, b"hello").unwrap();

        let inode_id = fs.handles.inode_id(handle).unwrap();
        let inode = read_inode(&mut fs.dev, &fs.sb, inode_id).unwrap();
        let single = inode.blocks[crate::inode::SINGLE_INDIRECT];
        assert_ne!(single, 0);
        let block = block_for_offset(&mut fs.dev, &inode, offset).unwrap();
        assert_ne!(block, 0);
    }

    #[test]
    fn unlink_frees_all_block_levels() {
        let (_guard, path) = fresh_image();
        let mut fs = FileSystem::mount(&path).unwrap();
        let (_attr, handle) = fs.create("/f").unwrap();
        let free_before = fs.sb.num_free_blocks;

        // Write contiguously past the direct and single-indirect capacity so the double-indirect
        // block also gets populated, then unlink and check every level's blocks came back.
        let direct_capacity = crate::inode::DIRECT_BLOCKS * BLOCK_SIZE;
        let single_capacity = crate::indirect::IDS_PER_BLOCK * BLOCK_SIZE;
        let total = direct_capacity + single_capacity + BLOCK_SIZE;
        fs.write(handle, 0, &vec![0u8; total]).unwrap();

        fs.release(handle);
        fs.unlink("/f").unwrap();
        let free_after = fs.sb.num_free_blocks;
        assert_eq!(free_after, free_before);
    }

    #[test]
    fn directory_capacity_is_448_entries() {
        let (_guard, path) = fresh_image();
        let mut fs = FileSystem::mount(&path).unwrap();
        fs.mkdir("/d").unwrap();
        for i in 0..crate::dirent::MAX_ENTRIES {
            let (_attr, handle) = fs.create(&format!("/d/f{i}")).unwrap();
            fs.release(handle);
        }
        let (_id, dir) = crate::path::resolve(&mut fs.dev, &fs.sb, "/d").unwrap();
        assert_eq!({ dir.child_count } as usize, crate::dirent::MAX_ENTRIES);

        assert!(matches!(
            fs.create("/d/one_too_many"),
            Err(FsError::NoSpace)
        ));
    }

    #[test]
    fn remove_middle_entry_compacts_dense() {
        let (_guard, path) = fresh_image();
        let mut fs = FileSystem::mount(&path).unwrap();
        fs.mkdir("/d").unwrap();
        for name in ["a", "b", "c"] {
            let (_attr, handle) = fs.create(&format!("/d/{name}")).unwrap();
            fs.release(handle);
        }

        fs.unlink("/d/b").unwrap();

        let (_id, dir) = crate::path::resolve(&mut fs.dev, &fs.sb, "/d").unwrap();
        assert_eq!({ dir.child_count }, 2);
        // Compaction moved "c" (the last entry) into "b"'s vacated slot rather than leaving a
        // tombstone, so both survivors are still packed at positions 0 and 1.
        let entries = crate::dirent::list_entries(&mut fs.dev, &dir).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|(n, _)| n == "a"));
        assert!(entries.iter().any(|(n, _)| n == "c"));

        // A fresh insertion lands at the now-vacant positional slot 1 without error.
        let (_attr, handle) = fs.create("/d/d").unwrap();
        fs.release(handle);
        let (_id, dir) = crate::path::resolve(&mut fs.dev, &fs.sb, "/d").unwrap();
        assert_eq!({ dir.child_count }, 3);
    }
}
