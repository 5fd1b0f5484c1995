//! The host integration binary: translates `fuser` FUSE upcalls into calls against
//! [`sfs_core::fs::FileSystem`].
//!
//! Argument parsing follows the same hand-rolled, `eprintln!`+`exit(1)` convention
//! `mount/src/main.rs` and `mkfs/src/main.rs` use rather than reaching for an argument-parsing
//! crate: `sfs [host-mount-options] <diskFile> <mountPoint>`, where only the last two positional
//! arguments matter to the core (§6) and everything before them is passed straight through to
//! `fuser::mount2` as raw FUSE mount options.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::process::exit;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request,
};

use sfs_core::error::FsError;
use sfs_core::fs::{Attr, FileSystem};
use sfs_core::inode::InodeType;

/// Attribute cache validity handed back with every reply; the core has no notion of a cache to
/// invalidate, so this is kept short rather than disabled outright.
const TTL: Duration = Duration::from_secs(1);

/// The FUSE ino of the root directory, reserved by the protocol; chosen to line up with the
/// core's root inode id (0) + 1 so `core_to_ino` stays a single addition.
const FUSE_ROOT_INO: u64 = 1;

fn core_to_ino(inode_id: u32) -> u64 {
    inode_id as u64 + 1
}

/// Bridges FUSE's inode-number addressing to the core's path-based operations: every path this
/// binary has handed an ino out for is remembered here so a later call addressed by ino alone
/// (`getattr`, `read`, `write`, ...) can still resolve a path for the core to walk.
///
/// The core itself never deals in paths-by-ino; this table exists solely at the host boundary,
/// the same layer §1 assigns the mount/dispatch translation to.
struct PathTable {
    paths: HashMap<u64, String>,
}

impl PathTable {
    fn new() -> Self {
        let mut paths = HashMap::new();
        paths.insert(FUSE_ROOT_INO, "/".to_string());
        Self { paths }
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    fn remember(&mut self, inode_id: u32, path: String) -> u64 {
        let ino = core_to_ino(inode_id);
        self.paths.insert(ino, path);
        ino
    }

    fn forget_path(&mut self, path: &str) {
        self.paths.retain(|_, p| p != path);
    }
}

fn child_path(parent: &str, name: &OsStr) -> Option<String> {
    let name = name.to_str()?;
    if parent == "/" {
        Some(format!("/{name}"))
    } else {
        Some(format!("{parent}/{name}"))
    }
}

fn file_attr(ino: u64, attr: &Attr) -> FileAttr {
    let kind = match attr.kind {
        InodeType::File => FileType::RegularFile,
        InodeType::Dir => FileType::Directory,
    };
    let mtime = UNIX_EPOCH + Duration::from_secs(attr.last_modify as u64);
    let atime = UNIX_EPOCH + Duration::from_secs(attr.last_access as u64);
    let ctime = UNIX_EPOCH + Duration::from_secs(attr.last_change as u64);
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime,
        mtime,
        ctime,
        crtime: ctime,
        kind,
        perm: attr.perm,
        nlink: attr.nlink,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: sfs_core::superblock::BLOCK_SIZE as u32,
        flags: 0,
    }
}

/// A mounted image plus the ino/path bridge, implementing `fuser::Filesystem` over
/// [`FileSystem`]. Owns no lock: §5 requires the host to serialize, which `fuser`'s single
/// dispatch loop already does by construction.
struct Sfs {
    fs: FileSystem,
    paths: PathTable,
}

impl Sfs {
    fn new(fs: FileSystem) -> Self {
        Self {
            fs,
            paths: PathTable::new(),
        }
    }
}

impl Filesystem for Sfs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.paths.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(path) = child_path(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.paths.remember(attr.inode_id, path);
                reply.entry(&TTL, &file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(-e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.paths.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &file_attr(ino, &attr)),
            Err(e) => reply.error(-e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.paths.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(path) = child_path(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.mkdir(&path) {
            Ok(attr) => {
                let ino = self.paths.remember(attr.inode_id, path);
                reply.entry(&TTL, &file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(-e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.paths.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(path) = child_path(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.paths.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(-e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.paths.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(path) = child_path(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.paths.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(-e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.paths.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(path) = child_path(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.create(&path) {
            Ok((attr, handle)) => {
                let ino = self.paths.remember(attr.inode_id, path);
                // `create`'s handle doubles as the fh; `flags` is accepted and carried through
                // the host's open-file accounting but never enforced (§1, §4.8).
                let _ = flags;
                reply.created(&TTL, &file_attr(ino, &attr), 0, handle, 0);
            }
            Err(e) => reply.error(-e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.paths.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.open(&path, flags) {
            Ok(handle) => reply.opened(handle, 0),
            Err(e) => reply.error(-e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.fs.release(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, flags: i32, reply: ReplyOpen) {
        // Directories share the same handle table as files; the core has no separate directory
        // handle concept, so the fh is unused by `readdir` below (it re-resolves by path).
        let _ = flags;
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.paths.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        // Synthesize `.`/`..` ahead of the on-disk entries: the core itself never materializes
        // them (§4.8 mkdir creates neither), so the host layer that owns the ino/path bridge is
        // the natural place to add the two conventional pseudo-entries a directory listing needs.
        let parent_ino = if ino == FUSE_ROOT_INO {
            FUSE_ROOT_INO
        } else {
            let parent_path = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            let parent_path = if parent_path.is_empty() { "/" } else { parent_path };
            match self.fs.getattr(parent_path) {
                Ok(attr) => core_to_ino(attr.inode_id),
                Err(_) => FUSE_ROOT_INO,
            }
        };
        let mut synthetic = vec![(ino, FileType::Directory, ".".to_string())];
        synthetic.push((parent_ino, FileType::Directory, "..".to_string()));

        let mut index: i64 = 0;
        let mut full = false;
        for (entry_ino, kind, name) in synthetic {
            if index >= offset {
                if reply.add(entry_ino, index + 1, kind, &name) {
                    full = true;
                    break;
                }
            }
            index += 1;
        }
        if full {
            reply.ok();
            return;
        }

        let result = self.fs.readdir(&path, |name, inode_id| {
            if index < offset {
                index += 1;
                return true;
            }
            let entry_ino = core_to_ino(inode_id);
            // `fuser::ReplyDirectory::add`'s kind is only a hint the kernel is free to verify
            // with a follow-up `lookup`; the core's readdir callback hands back just a name and
            // an inode id (§4.8), so there is no type to report here without a second lookup per
            // entry.
            let full = reply.add(entry_ino, index + 1, FileType::RegularFile, name);
            index += 1;
            !full
        });
        match result {
            Ok(()) | Err(FsError::NoSpace) => reply.ok(),
            Err(e) => reply.error(-e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.fs.read(fh, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(-e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.fs.write(fh, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(-e.errno()),
        }
    }
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} [host-mount-options] <diskFile> <mountPoint>");
}

fn main() {
    env_logger::init();

    let all_args: Vec<String> = std::env::args().collect();
    let program = all_args.first().cloned().unwrap_or_else(|| "sfs".to_string());
    let positional = &all_args[1..];

    if positional.len() < 2 {
        print_usage(&program);
        exit(1);
    }
    let (disk_file, mount_point) = (
        &positional[positional.len() - 2],
        &positional[positional.len() - 1],
    );
    let host_options = &positional[..positional.len() - 2];

    let mut options = vec![MountOption::FSName("sfs".to_string())];
    for opt in host_options {
        // Host mount options are passed straight through as raw FUSE options; parsing their
        // meaning is the dispatch layer's job (§1), not the core's.
        options.push(MountOption::CUSTOM(opt.clone()));
    }

    let fs = match FileSystem::mount(std::path::Path::new(disk_file)) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("{program}: failed to mount {disk_file}: {e}");
            exit(1);
        }
    };

    log::info!("mounting {disk_file} at {mount_point}");
    if let Err(e) = fuser::mount2(Sfs::new(fs), mount_point, &options) {
        eprintln!("{program}: {e}");
        exit(1);
    }
}
