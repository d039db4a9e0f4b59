//! Archive unpacking.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;
use xz2::read::XzDecoder;

use kw_core::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarXz,
    TarZst,
    Tar,
}

/// Detect the archive format from magic bytes.
pub fn detect_format(path: &Path) -> Result<ArchiveFormat, Error> {
    let mut file = File::open(path).map_err(|e| Error::StoreCorruption {
        message: format!("failed to open archive {}: {e}", path.display()),
    })?;
    let mut magic = [0u8; 512];
    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                return Err(Error::StoreCorruption {
                    message: format!("failed to read archive {}: {e}", path.display()),
                });
            }
        }
    }
    let magic = &magic[..filled];

    if magic.starts_with(&[0x1f, 0x8b]) {
        Ok(ArchiveFormat::TarGz)
    } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Ok(ArchiveFormat::TarXz)
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Ok(ArchiveFormat::TarZst)
    } else if magic.len() >= 262 && &magic[257..262] == b"ustar" {
        Ok(ArchiveFormat::Tar)
    } else {
        Err(Error::LayoutMismatch {
            path: path.to_path_buf(),
            message: "artifact is not a tar, tar.gz, tar.xz or tar.zst archive".to_string(),
        })
    }
}

fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>, Error> {
    let format = detect_format(path)?;
    let file = File::open(path).map_err(|e| Error::StoreCorruption {
        message: format!("failed to open archive {}: {e}", path.display()),
    })?;
    let file = BufReader::new(file);

    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::TarXz => Box::new(XzDecoder::new(file)),
        ArchiveFormat::TarZst => {
            Box::new(zstd::Decoder::new(file).map_err(|e| Error::StoreCorruption {
                message: format!("failed to create zstd decoder: {e}"),
            })?)
        }
        ArchiveFormat::Tar => Box::new(file),
    };

    Ok(Archive::new(reader))
}

/// Unpack the archive at `path` into `dest`.
///
/// Entries that are absolute or climb out of `dest` with `..` abort the
/// extraction.
pub fn extract_archive(path: &Path, dest: &Path) -> Result<(), Error> {
    let mut archive = open_archive(path)?;
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = archive.entries().map_err(|e| Error::StoreCorruption {
        message: format!("failed to read archive entries: {e}"),
    })?;

    let mut count = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::StoreCorruption {
            message: format!("failed to read archive entry: {e}"),
        })?;
        let entry_path = entry
            .path()
            .map_err(|e| Error::StoreCorruption {
                message: format!("invalid archive entry path: {e}"),
            })?
            .into_owned();

        if !is_contained(&entry_path) {
            return Err(Error::LayoutMismatch {
                path: entry_path,
                message: "archive entry escapes the extraction directory".to_string(),
            });
        }

        entry.unpack_in(dest).map_err(|e| Error::StoreCorruption {
            message: format!("failed to unpack {}: {e}", entry_path.display()),
        })?;
        count += 1;
    }

    debug!(archive = %path.display(), entries = count, "extracted archive");
    Ok(())
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// The root of an unpacked tree: its only top-level directory when the
/// archive wraps everything in one (as release tarballs usually do).
pub fn unpacked_root(dir: &Path) -> Result<PathBuf, Error> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| Error::StoreCorruption {
            message: format!("failed to read {}: {e}", dir.display()),
        })?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with("._"))
        });

    match (entries.next(), entries.next()) {
        (Some(only), None) if only.symlink_metadata().is_ok_and(|m| m.is_dir()) => Ok(only),
        _ => Ok(dir.to_path_buf()),
    }
}
