//! The on-disk core of a single-image UNIX-like filesystem: superblock, bitmap, inode table,
//! indirection mapper, directory entries, path resolution and the file-op façade.
//!
//! This crate is the core only (§1 of the format's spec): the host mount/dispatch layer, argument
//! parsing, and any concurrency are external collaborators. See `src/bin/sfs.rs` for the FUSE
//! host integration built on top of [`fs::FileSystem`].

pub mod bitmap;
pub mod block;
pub mod dirent;
pub mod error;
pub mod fs;
pub mod handle;
pub mod indirect;
pub mod inode;
pub mod path;
pub mod superblock;
pub mod util;
