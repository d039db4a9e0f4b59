//! Filesystem helpers shared by the fetch, layout and smoke-test stages.

use std::fs;
use std::io;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;

use walkdir::WalkDir;

use kw_core::Error;

pub(crate) fn store_err(context: impl std::fmt::Display, e: impl std::fmt::Display) -> Error {
    Error::StoreCorruption {
        message: format!("{context}: {e}"),
    }
}

/// Copy a file, symlink or directory tree from `src` to `dst`.
///
/// Permissions are preserved and symlinks are recreated as symlinks rather
/// than followed. `dst` must not exist yet; its parent is created.
///
/// Directory modes are applied once the walk is done, deepest first, so a
/// read-only upstream directory can still be filled. The owner keeps `rwx`
/// on copied directories so the tree can later be replaced or removed.
pub fn copy_path(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        return copy_entry(src, dst, &meta);
    }

    let mut dir_modes = Vec::new();
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata()?;
        if meta.is_dir() {
            fs::create_dir_all(&target)?;
            dir_modes.push((target, meta.permissions().mode() | 0o700));
        } else {
            copy_entry(entry.path(), &target, &meta)?;
        }
    }

    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

fn copy_entry(src: &Path, dst: &Path, meta: &fs::Metadata) -> io::Result<()> {
    if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        symlink(target, dst)
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

/// Remove whatever is at `path`, if anything.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move `src` to `dst`, falling back to copy and delete across filesystems.
pub fn move_path(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            copy_path(src, dst)?;
            remove_path(src)
        }
        Err(e) => Err(e),
    }
}

pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|e| e.path().symlink_metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn copies_tree_with_modes_and_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(src.join("bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("tool", src.join("bin/alias")).unwrap();

        let dst = tmp.path().join("out/dst");
        copy_path(&src, &dst).unwrap();

        let mode = fs::metadata(dst.join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            fs::read_link(dst.join("bin/alias")).unwrap(),
            Path::new("tool")
        );
    }

    #[test]
    fn fills_read_only_directories() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("lib/ext")).unwrap();
        fs::write(src.join("lib/a.jar"), "jar").unwrap();
        fs::write(src.join("lib/ext/b.jar"), "ext").unwrap();
        fs::set_permissions(src.join("lib/ext"), fs::Permissions::from_mode(0o555)).unwrap();
        fs::set_permissions(src.join("lib"), fs::Permissions::from_mode(0o555)).unwrap();

        let dst = tmp.path().join("dst");
        copy_path(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("lib/a.jar")).unwrap(), "jar");
        assert_eq!(fs::read_to_string(dst.join("lib/ext/b.jar")).unwrap(), "ext");
        let mode = fs::metadata(dst.join("lib")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        // The copy stays removable by its owner
        remove_path(&dst).unwrap();
        assert!(!dst.exists());

        fs::set_permissions(src.join("lib"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(src.join("lib/ext"), fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn remove_path_handles_missing_and_links() {
        let tmp = TempDir::new().unwrap();
        remove_path(&tmp.path().join("missing")).unwrap();

        let dir = tmp.path().join("dir");
        fs::create_dir(&dir).unwrap();
        let link = tmp.path().join("link");
        symlink(&dir, &link).unwrap();

        remove_path(&link).unwrap();
        assert!(dir.exists(), "removing a link must not touch its target");
        remove_path(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn dir_size_counts_regular_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a"), b"12345").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/b"), b"1234567890").unwrap();
        assert_eq!(dir_size(tmp.path()), 15);
    }
}
