//! SHA-256 digests for artifact files and directory trees.
//!
//! A tree digest hashes the sorted walk of a directory. Each entry
//! contributes `kind \0 relative-path \0`; regular files then add their
//! length (8 bytes, little endian) and content, symlinks add their target.
//! Modes and timestamps are not part of the digest.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn sha256_reader(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    sha256_reader(File::open(path)?)
}

/// Digest of the file at `path`, or the tree digest when it is a directory.
pub fn digest_path(path: &Path) -> io::Result<String> {
    if fs::metadata(path)?.is_dir() {
        tree_digest(path)
    } else {
        sha256_file(path)
    }
}

pub fn tree_digest(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .replace('\\', "/");
        let file_type = entry.file_type();

        let kind: &[u8] = if file_type.is_symlink() {
            b"link"
        } else if file_type.is_dir() {
            b"dir"
        } else {
            b"file"
        };
        hasher.update(kind);
        hasher.update([0u8]);
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_file() {
            let mut file = File::open(entry.path())?;
            hasher.update(file.metadata()?.len().to_le_bytes());
            io::copy(&mut file, &mut HashWriter(&mut hasher))?;
        }
    }

    Ok(to_hex(&hasher.finalize()))
}

struct HashWriter<'a>(&'a mut Sha256);

impl io::Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
