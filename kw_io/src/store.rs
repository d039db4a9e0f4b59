use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::{debug, info};

use crate::extract::{extract_archive, unpacked_root};
use crate::fsutil::dir_size;
use kw_core::Error;

/// Unpacked archives, one directory per artifact hash.
pub struct Store {
    store_dir: PathBuf,
    locks_dir: PathBuf,
}

impl Store {
    pub fn new(root: &Path) -> io::Result<Self> {
        let store_dir = root.join("store");
        let locks_dir = root.join("locks");

        fs::create_dir_all(&store_dir)?;
        fs::create_dir_all(&locks_dir)?;

        Ok(Self {
            store_dir,
            locks_dir,
        })
    }

    pub fn entry_path(&self, sha256: &str) -> PathBuf {
        self.store_dir.join(sha256)
    }

    pub fn has_entry(&self, sha256: &str) -> bool {
        self.entry_path(sha256).exists()
    }

    fn lock(&self, sha256: &str) -> Result<File, Error> {
        let lock_path = self.locks_dir.join(format!("{sha256}.lock"));
        let lock_file = File::create(&lock_path).map_err(|e| Error::StoreCorruption {
            message: format!("failed to create lock file: {e}"),
        })?;

        lock_file
            .lock_exclusive()
            .map_err(|e| Error::StoreCorruption {
                message: format!("failed to acquire lock: {e}"),
            })?;

        Ok(lock_file)
    }

    /// Unpack `archive` once and return the root of its unpacked tree.
    pub fn ensure_entry(&self, sha256: &str, archive: &Path) -> Result<PathBuf, Error> {
        let entry_path = self.entry_path(sha256);

        if entry_path.exists() {
            debug!(sha256, "reusing unpacked artifact");
            return unpacked_root(&entry_path);
        }

        let _lock = self.lock(sha256)?;

        // Another process may have unpacked it while we waited for the lock
        if entry_path.exists() {
            return unpacked_root(&entry_path);
        }

        let tmp_dir = self
            .store_dir
            .join(format!(".{sha256}.tmp.{}", std::process::id()));

        // Leftover from an interrupted extraction by a process with our pid
        if tmp_dir.exists() {
            let _ = fs::remove_dir_all(&tmp_dir);
        }

        fs::create_dir_all(&tmp_dir).map_err(|e| Error::StoreCorruption {
            message: format!("failed to create temp directory: {e}"),
        })?;

        if let Err(e) = extract_archive(archive, &tmp_dir) {
            let _ = fs::remove_dir_all(&tmp_dir);
            return Err(e);
        }

        if let Err(e) = fs::rename(&tmp_dir, &entry_path) {
            let _ = fs::remove_dir_all(&tmp_dir);
            return Err(Error::StoreCorruption {
                message: format!("failed to rename store entry: {e}"),
            });
        }

        info!(sha256, path = %entry_path.display(), "unpacked artifact");
        unpacked_root(&entry_path)
    }

    pub fn remove_entry(&self, sha256: &str) -> Result<(), Error> {
        let entry_path = self.entry_path(sha256);

        if !entry_path.exists() {
            return Ok(());
        }

        let _lock = self.lock(sha256)?;

        if entry_path.exists() {
            fs::remove_dir_all(&entry_path).map_err(|e| Error::StoreCorruption {
                message: format!("failed to remove store entry: {e}"),
            })?;
        }

        let _ = fs::remove_file(self.locks_dir.join(format!("{sha256}.lock")));

        Ok(())
    }

    /// List all store entries (directories in the store)
    pub fn list_entries(&self) -> io::Result<Vec<String>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(&self.store_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
                && !name.starts_with('.')
            {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    /// Clean up stale lock files (locks without corresponding store entries)
    /// Returns the number of lock files removed
    pub fn cleanup_stale_locks(&self) -> io::Result<usize> {
        let mut count = 0;

        for entry in fs::read_dir(&self.locks_dir)? {
            let entry = entry?;
            let path = entry.path();

            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && let Some(sha256) = name.strip_suffix(".lock")
                && !self.has_entry(sha256)
                && fs::remove_file(&path).is_ok()
            {
                count += 1;
            }
        }

        Ok(count)
    }

    /// Clean up stale temp directories from interrupted extractions
    /// Returns the count of directories removed and total bytes freed
    pub fn cleanup_temp_dirs(&self) -> io::Result<(usize, u64)> {
        let mut count = 0;
        let mut bytes_freed = 0;

        for entry in fs::read_dir(&self.store_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
                && name.starts_with('.')
                && name.contains(".tmp.")
            {
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

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use std::sync::Arc;
    use std::thread;
    use tar::Builder;
    use tempfile::TempDir;

    fn create_test_tarball(top: &str, content: &[u8]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());

        let mut header = tar::Header::new_gnu();
        header.set_path(format!("{top}/bin/tool")).unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append(&header, content).unwrap();

        let tar_data = builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_data).unwrap();
        encoder.finish().unwrap()
    }

    fn write_archive(tmp: &TempDir, content: &[u8]) -> PathBuf {
        let path = tmp.path().join("pkg.tar.gz");
        fs::write(&path, create_test_tarball("pkg-1.0", content)).unwrap();
        path
    }

    #[test]
    fn unpacks_into_top_level_directory() {
        let tmp = TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let archive = write_archive(&tmp, b"hello");

        let root = store.ensure_entry("abc123", &archive).unwrap();
        assert_eq!(root, store.entry_path("abc123").join("pkg-1.0"));
        assert_eq!(fs::read(root.join("bin/tool")).unwrap(), b"hello");
    }

    #[test]
    fn second_call_is_noop() {
        let tmp = TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let archive = write_archive(&tmp, b"hello world");

        let root1 = store.ensure_entry("abc123", &archive).unwrap();
        fs::write(root1.join("marker.txt"), "original").unwrap();

        let root2 = store.ensure_entry("abc123", &archive).unwrap();
        assert_eq!(root1, root2);
        assert!(root2.join("marker.txt").exists());
    }

    #[test]
    fn concurrent_calls_unpack_once() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let archive = write_archive(&tmp, b"concurrent test");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let archive = archive.clone();
                thread::spawn(move || store.ensure_entry("concurrent123", &archive))
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        let root = store.entry_path("concurrent123").join("pkg-1.0");
        assert_eq!(
            fs::read_to_string(root.join("bin/tool")).unwrap(),
            "concurrent test"
        );
    }

    #[test]
    fn failed_extraction_leaves_no_entry() {
        let tmp = TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let bogus = tmp.path().join("bogus.tar.gz");
        fs::write(&bogus, "not an archive").unwrap();

        assert!(store.ensure_entry("bad", &bogus).is_err());
        assert!(!store.has_entry("bad"));
        assert!(store.list_entries().unwrap().is_empty());
    }

    #[test]
    fn remove_entry_and_stale_locks() {
        let tmp = TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let archive = write_archive(&tmp, b"x");
        store.ensure_entry("keep", &archive).unwrap();
        store.ensure_entry("gone", &archive).unwrap();

        store.remove_entry("gone").unwrap();
        assert_eq!(store.list_entries().unwrap(), vec!["keep".to_string()]);

        fs::write(tmp.path().join("locks/orphan.lock"), b"").unwrap();
        assert_eq!(store.cleanup_stale_locks().unwrap(), 1);
        assert!(!tmp.path().join("locks/orphan.lock").exists());
    }

    #[test]
    fn cleanup_temp_dirs_removes_stale_temp_directories() {
        let tmp = TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let store_dir = tmp.path().join("store");
        fs::create_dir_all(store_dir.join(".abc123.tmp.1234")).unwrap();
        fs::write(store_dir.join(".abc123.tmp.1234/file.txt"), b"temp file").unwrap();
        fs::create_dir_all(store_dir.join(".def456.tmp.5678")).unwrap();

        let (count, bytes) = store.cleanup_temp_dirs().unwrap();
        assert_eq!(count, 2);
        assert_eq!(bytes, 9);
        assert!(!store_dir.join(".abc123.tmp.1234").exists());
    }
}
