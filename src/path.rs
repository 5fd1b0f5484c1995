//! Absolute path resolution: walks `/`-separated components from the root inode, one
//! [`crate::dirent::find_entry`] lookup per component.
//!
//! The source mutated the caller's path buffer in place, writing NULs at each `/` to carve out
//! components; §9's required re-architecture calls that out specifically, so this instead splits
//! an immutable `&str` with [`str::split`] and never touches the caller's string.

use crate::block::BlockDevice;
use crate::dirent::{find_entry, NAME_MAX};
use crate::error::{FsError, Result};
use crate::inode::{read_inode, Inode, ROOT_INODE};
use crate::superblock::Superblock;

/// Splits `path` into its `/`-separated components, rejecting anything that isn't absolute and
/// any component longer than [`NAME_MAX`]. A trailing slash is ignored.
fn components(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidPath);
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let parts: Vec<&str> = trimmed.split('/').filter(|c| !c.is_empty()).collect();
    for c in &parts {
        if c.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
    }
    Ok(parts)
}

/// Resolves an absolute path to its inode id and record.
///
/// `/` itself resolves to the root inode. A non-terminal component that is not a directory fails
/// with [`FsError::NotADirectory`]; a missing component at any depth fails with
/// [`FsError::NotFound`].
pub fn resolve(dev: &mut BlockDevice, sb: &Superblock, path: &str) -> Result<(u32, Inode)> {
    let parts = components(path)?;
    let mut id = ROOT_INODE;
    let mut inode = read_inode(dev, sb, id)?;
    for part in parts {
        if !inode.is_dir() {
            log::debug!("resolve({path}): {part} is not a directory");
            return Err(FsError::NotADirectory);
        }
        let Some(child_id) = find_entry(dev, &inode, part)? else {
            log::debug!("resolve({path}): {part} not found");
            return Err(FsError::NotFound);
        };
        id = child_id;
        inode = read_inode(dev, sb, id)?;
    }
    Ok((id, inode))
}

/// Resolves the directory that would contain `path`, and returns it alongside the final path
/// component's name. The root's parent is the root itself.
///
/// Used by operations that must touch a directory's entries before the child they name
/// necessarily exists (`create`, `mkdir`, `unlink`, `rmdir`).
pub fn resolve_parent<'a>(
    dev: &mut BlockDevice,
    sb: &Superblock,
    path: &'a str,
) -> Result<(u32, Inode, &'a str)> {
    let parts = components(path)?;
    let Some((&last, init)) = parts.split_last() else {
        let root = read_inode(dev, sb, ROOT_INODE)?;
        return Ok((ROOT_INODE, root, ""));
    };
    let mut id = ROOT_INODE;
    let mut inode = read_inode(dev, sb, id)?;
    for part in init {
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let Some(child_id) = find_entry(dev, &inode, part)? else {
            return Err(FsError::NotFound);
        };
        id = child_id;
        inode = read_inode(dev, sb, id)?;
    }
    if !inode.is_dir() {
        return Err(FsError::NotADirectory);
    }
    Ok((id, inode, last))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_relative_paths() {
        assert!(matches!(components("a/b"), Err(FsError::InvalidPath)));
    }

    #[test]
    fn strips_trailing_slash() {
        assert_eq!(components("/a/b/").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn root_has_no_components() {
        assert!(components("/").unwrap().is_empty());
    }

    #[test]
    fn rejects_overlong_component() {
        let long = format!("/{}", "x".repeat(NAME_MAX + 1));
        assert!(matches!(components(&long), Err(FsError::NameTooLong)));
    }
}
