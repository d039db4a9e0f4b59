use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::digest::{to_hex, tree_digest};
use crate::fsutil::{copy_path, dir_size};
use kw_core::Error;

/// Content-addressed cache of verified artifacts.
///
/// ```text
/// <cache>/blobs/<sha256>   verified archive or single-file artifact
/// <cache>/trees/<sha256>   verified copy of a directory artifact
/// <cache>/tmp/             in-flight downloads and tree copies
/// ```
#[derive(Clone)]
pub struct BlobCache {
    blobs_dir: PathBuf,
    trees_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl BlobCache {
    pub fn new(cache_root: &Path) -> io::Result<Self> {
        let blobs_dir = cache_root.join("blobs");
        let trees_dir = cache_root.join("trees");
        let tmp_dir = cache_root.join("tmp");

        fs::create_dir_all(&blobs_dir)?;
        fs::create_dir_all(&trees_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            blobs_dir,
            trees_dir,
            tmp_dir,
        })
    }

    pub fn blob_path(&self, sha256: &str) -> PathBuf {
        self.blobs_dir.join(sha256)
    }

    pub fn tree_path(&self, sha256: &str) -> PathBuf {
        self.trees_dir.join(sha256)
    }

    pub fn has_blob(&self, sha256: &str) -> bool {
        self.blob_path(sha256).is_file()
    }

    pub fn has_tree(&self, sha256: &str) -> bool {
        self.tree_path(sha256).is_dir()
    }

    pub fn remove_blob(&self, sha256: &str) -> io::Result<bool> {
        let path = self.blob_path(sha256);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Start writing a blob that must hash to `sha256` before it is committed.
    pub fn start_write(&self, sha256: &str) -> io::Result<BlobWriter> {
        let final_path = self.blob_path(sha256);
        let unique_id = std::process::id();
        let thread_id = std::thread::current().id();
        let tmp_path = self
            .tmp_dir
            .join(format!("{sha256}.{unique_id}.{thread_id:?}.part"));

        let file = fs::File::create(&tmp_path)?;

        Ok(BlobWriter {
            file,
            hasher: Sha256::new(),
            expected: sha256.to_string(),
            tmp_path,
            final_path,
            committed: false,
        })
    }

    /// Copy the directory `src` into the cache, verifying its tree digest on
    /// the copy so a source changing underneath us cannot slip through.
    pub fn store_tree(&self, sha256: &str, src: &Path) -> Result<PathBuf, Error> {
        let final_path = self.tree_path(sha256);
        let staging = TreeStaging {
            path: self
                .tmp_dir
                .join(format!(".{sha256}.tmp.{}", std::process::id())),
            committed: false,
        };
        if staging.path.exists() {
            let _ = fs::remove_dir_all(&staging.path);
        }

        copy_path(src, &staging.path).map_err(|e| Error::Fetch {
            location: src.display().to_string(),
            message: format!("failed to copy directory: {e}"),
        })?;

        let actual = tree_digest(&staging.path).map_err(|e| Error::Fetch {
            location: src.display().to_string(),
            message: format!("failed to digest directory: {e}"),
        })?;
        if actual != sha256 {
            return Err(Error::Integrity {
                expected: sha256.to_string(),
                actual,
                file_name: src.file_name().map(|n| n.to_string_lossy().into_owned()),
            });
        }

        staging.commit(&final_path)
    }

    /// Remove all blobs except those in the keep_set
    /// Returns the list of removed sha256 hashes and the total bytes freed
    pub fn remove_blobs_except(
        &self,
        keep_set: &std::collections::HashSet<String>,
    ) -> io::Result<(Vec<String>, u64)> {
        let mut removed = Vec::new();
        let mut bytes_freed = 0;

        for entry in fs::read_dir(&self.blobs_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && !keep_set.contains(name)
                && let Ok(metadata) = entry.metadata()
            {
                let size = metadata.len();
                if fs::remove_file(entry.path()).is_ok() {
                    removed.push(name.to_string());
                    bytes_freed += size;
                }
            }
        }

        removed.sort();
        Ok((removed, bytes_freed))
    }

    /// Remove cached trees whose hash is not in `keep_set`.
    /// Returns the removed hashes and the total bytes freed.
    pub fn remove_trees_except(
        &self,
        keep_set: &std::collections::HashSet<String>,
    ) -> io::Result<(Vec<String>, u64)> {
        let mut removed = Vec::new();
        let mut bytes_freed = 0;

        for entry in fs::read_dir(&self.trees_dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(name) = entry.file_name().to_str()
                && !keep_set.contains(name)
            {
                let size = dir_size(&path);
                if fs::remove_dir_all(&path).is_ok() {
                    removed.push(name.to_string());
                    bytes_freed += size;
                }
            }
        }

        Ok((removed, bytes_freed))
    }

    /// Clean up partial downloads and abandoned tree copies.
    /// Returns the number of entries removed and bytes freed
    pub fn cleanup_temp_files(&self) -> io::Result<(usize, u64)> {
        let mut count = 0;
        let mut bytes_freed = 0;

        for entry in fs::read_dir(&self.tmp_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };

            if name.ends_with(".part")
                && let Ok(metadata) = entry.metadata()
            {
                let size = metadata.len();
                if fs::remove_file(&path).is_ok() {
                    count += 1;
                    bytes_freed += size;
                }
            } else if name.starts_with('.') && name.contains(".tmp.") {
                let size = dir_size(&path);
                if fs::remove_dir_all(&path).is_ok() {
                    count += 1;
                    bytes_freed += size;
                }
            }
        }

        Ok((count, bytes_freed))
    }
}

/// An in-flight blob. Bytes are hashed as they are written; the blob only
/// becomes visible under its final name if the hash matches.
pub struct BlobWriter {
    file: fs::File,
    hasher: Sha256,
    expected: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl BlobWriter {
    pub fn commit(mut self, file_name: Option<String>) -> Result<PathBuf, Error> {
        self.file.flush().map_err(|e| Error::Fetch {
            location: self.final_path.display().to_string(),
            message: format!("failed to flush blob: {e}"),
        })?;

        let actual = to_hex(&self.hasher.clone().finalize());
        if actual != self.expected {
            // Drop removes the temp file
            return Err(Error::Integrity {
                expected: self.expected.clone(),
                actual,
                file_name,
            });
        }

        // A racing fetch of the same artifact may have committed first
        if self.final_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
            self.committed = true;
            return Ok(self.final_path.clone());
        }

        match fs::rename(&self.tmp_path, &self.final_path) {
            Ok(()) => {}
            Err(_e) if self.final_path.exists() => {
                let _ = fs::remove_file(&self.tmp_path);
            }
            Err(e) => {
                return Err(Error::StoreCorruption {
                    message: format!("failed to rename blob: {e}"),
                });
            }
        }

        self.committed = true;
        Ok(self.final_path.clone())
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed && self.tmp_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

struct TreeStaging {
    path: PathBuf,
    committed: bool,
}

impl TreeStaging {
    fn commit(mut self, final_path: &Path) -> Result<PathBuf, Error> {
        if final_path.exists() {
            let _ = fs::remove_dir_all(&self.path);
            self.committed = true;
            return Ok(final_path.to_path_buf());
        }

        match fs::rename(&self.path, final_path) {
            Ok(()) => {}
            Err(_e) if final_path.exists() => {
                let _ = fs::remove_dir_all(&self.path);
            }
            Err(e) => {
                return Err(Error::StoreCorruption {
                    message: format!("failed to rename tree: {e}"),
                });
            }
        }

        self.committed = true;
        Ok(final_path.to_path_buf())
    }
}

impl Drop for TreeStaging {
    fn drop(&mut self) {
        if !self.committed && self.path.exists() {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}
