//! The error taxonomy for the filesystem core.
//!
//! Every fallible core operation returns `Result<T, FsError>`. The host integration layer
//! (`src/bin/sfs.rs`) is the only place that ever turns a variant back into a raw negative
//! `errno`, via [`FsError::errno`].

use std::io;

/// A core operation failed.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// A path component does not exist.
    #[error("no such file or directory")]
    NotFound,
    /// `mkdir`/`create` target already exists where uniqueness was required.
    #[error("file already exists")]
    AlreadyExists,
    /// A non-terminal path component is not a directory.
    #[error("not a directory")]
    NotADirectory,
    /// `rmdir` on a directory whose `childCount` is non-zero.
    #[error("directory not empty")]
    NotEmpty,
    /// The bitmap, the inode table, or a directory's entry capacity is exhausted.
    #[error("no space left on device")]
    NoSpace,
    /// The open file handle table is full.
    #[error("too many open files")]
    TooManyOpenFiles,
    /// A path component exceeds [`crate::dirent::NAME_MAX`] bytes.
    #[error("file name too long")]
    NameTooLong,
    /// A path does not start with `/`.
    #[error("invalid argument")]
    InvalidPath,
    /// The backing image read/write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Returns the negated POSIX error code a host exposes for this error.
    pub fn errno(&self) -> i32 {
        let code = match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NoSpace => libc::ENOSPC,
            FsError::TooManyOpenFiles => libc::EMFILE,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::InvalidPath => libc::EINVAL,
            FsError::Io(_) => libc::EIO,
        };
        -code
    }
}

/// Shorthand result type used throughout the core.
pub type Result<T> = std::result::Result<T, FsError>;
