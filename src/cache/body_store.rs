//! `CacheBodyStore`: the on-disk, key-addressed blob store under
//! `<root>/cache/<key>.data`, with `<root>/temp/<uuid>.data` staging for
//! atomic commit-or-discard writes.
//!
//! Grounded on `streaming_cache.rs`'s `ensure_dir_exists` / separate
//! metadata-vs-content layout idiom, adapted from that module's
//! content-digest addressing to the fingerprint-keyed layout this
//! system's external interface fixes (§6): body file names derive from
//! the cache key, not a content hash, so two distinct keys never share a
//! file even if their bodies happen to be identical.

use crate::error::Result;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const CACHE_DIR: &str = "cache";
const TEMP_DIR: &str = "temp";
const DATA_EXTENSION: &str = "data";

/// Content-addressed (by cache key) blob store rooted at `<root>`.
pub struct CacheBodyStore {
    root: PathBuf,
}

impl CacheBodyStore {
    /// Open the store at `root`, creating `cache/` and `temp/` if absent,
    /// and sweeping any leftover temp files from a prior process (they
    /// were never committed, so they're safe to discard).
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(CACHE_DIR))?;
        std::fs::create_dir_all(root.join(TEMP_DIR))?;
        let store = CacheBodyStore { root };
        store.sweep_temp()?;
        Ok(store)
    }

    fn sweep_temp(&self) -> Result<()> {
        let dir = self.root.join(TEMP_DIR);
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    pub fn body_path(&self, key: &str) -> PathBuf {
        self.root.join(CACHE_DIR).join(format!("{key}.{DATA_EXTENSION}"))
    }

    /// Allocate a fresh temp file path for a new write-in-progress tee.
    pub fn new_temp_path(&self) -> PathBuf {
        self.root.join(TEMP_DIR).join(format!("{}.{DATA_EXTENSION}", Uuid::new_v4()))
    }

    /// Create a [`tempfile::NamedTempFile`] inside `temp/` suitable for
    /// use as a `CachingBodyReader`'s tee sink.
    pub fn create_tee(&self) -> Result<tempfile::NamedTempFile> {
        Ok(tempfile::NamedTempFile::new_in(self.root.join(TEMP_DIR))?)
    }

    /// Commit a temp file to `cache/<key>.data`, replacing any existing
    /// file for that key atomically (same-filesystem rename).
    pub fn commit(&self, key: &str, temp: tempfile::NamedTempFile) -> Result<u64> {
        let dest = self.body_path(key);
        let len = temp.as_file().metadata()?.len();
        temp.persist(&dest).map_err(|e| e.error)?;
        Ok(len)
    }

    pub fn open_reader(&self, key: &str) -> Result<Option<std::fs::File>> {
        match std::fs::File::open(self.body_path(key)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.body_path(key).exists()
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.body_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Unlink every body file. Used by `evictAll`.
    pub fn remove_all(&self) -> Result<()> {
        let dir = self.root.join(CACHE_DIR);
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn commit_then_read_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = CacheBodyStore::open(dir.path()).unwrap();
        let mut tee = store.create_tee().unwrap();
        tee.write_all(b"response data 1").unwrap();
        let len = store.commit("k1", tee).unwrap();
        assert_eq!(len, 15);

        let mut file = store.open_reader("k1").unwrap().unwrap();
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut out).unwrap();
        assert_eq!(out, b"response data 1");
    }

    #[test]
    fn missing_key_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = CacheBodyStore::open(dir.path()).unwrap();
        assert!(store.open_reader("missing").unwrap().is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = CacheBodyStore::open(dir.path()).unwrap();
        let tee = store.create_tee().unwrap();
        store.commit("k1", tee).unwrap();
        store.remove("k1").unwrap();
        store.remove("k1").unwrap();
        assert!(!store.exists("k1"));
    }

    #[test]
    fn leftover_temp_files_are_swept_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = CacheBodyStore::open(dir.path()).unwrap();
            let _ = store.create_tee().unwrap().into_temp_path();
        }
        // Simulate a crash: leave a stray file directly in temp/.
        std::fs::write(dir.path().join("temp").join("stray.data"), b"x").unwrap();
        let store2 = CacheBodyStore::open(dir.path()).unwrap();
        let remaining: Vec<_> = std::fs::read_dir(dir.path().join("temp")).unwrap().collect();
        assert!(remaining.is_empty());
        drop(store2);
    }

    #[test]
    fn zero_length_body_is_stored() {
        let dir = TempDir::new().unwrap();
        let store = CacheBodyStore::open(dir.path()).unwrap();
        let tee = store.create_tee().unwrap();
        let len = store.commit("k1", tee).unwrap();
        assert_eq!(len, 0);
        assert!(store.exists("k1"));
    }
}
