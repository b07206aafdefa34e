//! Atomic JSON persistence
//!
//! Writes go through a sidecar lock file and a temp file:
//!
//! 1. `flock` `<path>.lock` exclusively
//! 2. serialize to `<path>.tmp`, flush and fsync
//! 3. rename `<path>.tmp` onto `<path>`
//! 4. unlink both sidecars, then release the lock
//!
//! The rename is the only step that makes new content visible, so readers see
//! either the previous document or the new one in full.
//!
//! Lock acquisition blocks without timeout. A process that dies holding the
//! lock leaves `<path>.lock` behind; it is not detected or reclaimed.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::errors::{Result, StoreError};

const LOCK_SUFFIX: &str = ".lock";
const TMP_SUFFIX: &str = ".tmp";

/// Reads and atomically writes JSON documents
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistentStore;

impl PersistentStore {
    pub fn new() -> Self {
        Self
    }

    /// Atomically replace the document at `path` with `value`
    ///
    /// # Returns
    /// Number of bytes written to disk
    pub fn write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<u64> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let lock_path = sidecar(path, LOCK_SUFFIX);
        let tmp_path = sidecar(path, TMP_SUFFIX);

        let lock = acquire_lock(&lock_path)?;
        let result = write_and_rename(path, &tmp_path, value);

        // Sidecars go before the lock is released: a waiter that wakes on the
        // unlinked lock file notices and retries against a fresh one.
        remove_sidecar(&tmp_path);
        remove_sidecar(&lock_path);
        drop(lock);

        match &result {
            Ok(bytes) => debug!(path = %path.display(), bytes = *bytes, "Wrote document"),
            Err(e) => warn!(path = %path.display(), error = %e, "Document write failed"),
        }
        result
    }

    /// Read and parse the document at `path`
    ///
    /// A document that fails to parse is deleted and reported as NotFound.
    /// This recovery is lossy on purpose: corrupt state is treated exactly like
    /// absent state so callers fall back to their defaults instead of failing
    /// forever, and the corrupt bytes are not kept around to be served later.
    pub fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                trace!(path = %path.display(), bytes = bytes.len(), "Read document");
                Ok(value)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Discarding corrupt document"
                );
                if let Err(rm) = remove_if_exists(path) {
                    warn!(path = %path.display(), error = %rm, "Failed to remove corrupt document");
                }
                Err(StoreError::NotFound(path.display().to_string()))
            }
        }
    }

    /// Delete the document at `path`
    ///
    /// # Returns
    /// true if a document was removed, false if none existed
    pub fn remove(&self, path: &Path) -> Result<bool> {
        let removed = remove_if_exists(path).map_err(|e| StoreError::io(path, e))?;
        if removed {
            debug!(path = %path.display(), "Removed document");
        }
        Ok(removed)
    }
}

/// `<path><suffix>`, e.g. `data.json.lock`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Take the exclusive lock on `lock_path`
///
/// Holders unlink the lock file before unlocking, so after waking we must
/// confirm the path still names the inode we locked.
fn acquire_lock(lock_path: &Path) -> Result<Flock<File>> {
    loop {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| StoreError::io(lock_path, e))?;

        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| StoreError::io(lock_path, io::Error::from(errno)))?;

        let held = lock.metadata().map_err(|e| StoreError::io(lock_path, e))?;
        match fs::metadata(lock_path) {
            Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                return Ok(lock);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(lock_path, e)),
        }

        trace!(lock = %lock_path.display(), "Lock file replaced while waiting, retrying");
    }
}

fn write_and_rename<T: Serialize + ?Sized>(path: &Path, tmp_path: &Path, value: &T) -> Result<u64> {
    let json = serde_json::to_vec_pretty(value)?;

    let mut tmp = File::create(tmp_path).map_err(|e| StoreError::io(tmp_path, e))?;
    tmp.write_all(&json)
        .and_then(|()| tmp.flush())
        .and_then(|()| tmp.sync_all())
        .map_err(|e| StoreError::io(tmp_path, e))?;
    drop(tmp);

    fs::rename(tmp_path, path).map_err(|e| StoreError::io(path, e))?;
    Ok(json.len() as u64)
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn remove_sidecar(path: &Path) {
    if let Err(e) = remove_if_exists(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove sidecar file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn doc_path(tmp: &TempDir) -> PathBuf {
        tmp.path().join("node").join("data.json")
    }

    #[test]
    fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let store = PersistentStore::new();
        let path = doc_path(&tmp);
        let value = json!({"prompts": ["a", "b"], "count": 2, "ratio": 0.5});

        let bytes = store.write(&path, &value).unwrap();
        assert_eq!(bytes, fs::metadata(&path).unwrap().len());

        let read: Value = store.read(&path).unwrap();
        assert_eq!(read, value);

        // Pretty-printed with two-space indent
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  \"count\": 2"));
    }

    #[test]
    fn test_sidecars_removed_after_write() {
        let tmp = TempDir::new().unwrap();
        let store = PersistentStore::new();
        let path = doc_path(&tmp);

        store.write(&path, &json!({"x": 1})).unwrap();

        assert!(!sidecar(&path, LOCK_SUFFIX).exists());
        assert!(!sidecar(&path, TMP_SUFFIX).exists());
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = PersistentStore::new();

        let err = store.read::<Value>(&doc_path(&tmp)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_corrupt_document_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let store = PersistentStore::new();
        let path = doc_path(&tmp);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{\"half\": [1, 2").unwrap();

        let err = store.read::<Value>(&path).unwrap_err();
        assert!(err.is_not_found());
        assert!(!path.exists());
    }

    #[test]
    fn test_interrupted_write_leaves_previous_document() {
        let tmp = TempDir::new().unwrap();
        let store = PersistentStore::new();
        let path = doc_path(&tmp);
        let before = json!({"version": 1});
        store.write(&path, &before).unwrap();

        // A writer that died between fsync and rename leaves these behind
        fs::write(sidecar(&path, TMP_SUFFIX), b"{\"version\": 2, \"trunc").unwrap();
        fs::write(sidecar(&path, LOCK_SUFFIX), b"").unwrap();

        let read: Value = store.read(&path).unwrap();
        assert_eq!(read, before);

        // The next writer takes over the stale (unlocked) lock file and cleans up
        let after = json!({"version": 3});
        store.write(&path, &after).unwrap();
        let read: Value = store.read(&path).unwrap();
        assert_eq!(read, after);
        assert!(!sidecar(&path, LOCK_SUFFIX).exists());
        assert!(!sidecar(&path, TMP_SUFFIX).exists());
    }

    #[test]
    fn test_failed_rename_keeps_target_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let store = PersistentStore::new();
        // A directory at the target path makes the rename fail
        let path = doc_path(&tmp);
        fs::create_dir_all(&path).unwrap();

        let err = store.write(&path, &json!({"x": 1})).unwrap_err();
        assert_eq!(err.code(), "ioFailure");

        assert!(path.is_dir());
        assert!(!sidecar(&path, LOCK_SUFFIX).exists());
        assert!(!sidecar(&path, TMP_SUFFIX).exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = PersistentStore::new();
        let path = doc_path(&tmp);
        store.write(&path, &json!([])).unwrap();

        assert!(store.remove(&path).unwrap());
        assert!(!store.remove(&path).unwrap());
    }

    #[test]
    fn test_concurrent_writers_never_tear_documents() {
        let tmp = TempDir::new().unwrap();
        let path = Arc::new(doc_path(&tmp));
        PersistentStore::new()
            .write(path.as_path(), &json!({"writer": 0, "seq": 0}))
            .unwrap();

        let mut handles = vec![];
        for writer in 1..=4 {
            let path = Arc::clone(&path);
            handles.push(thread::spawn(move || {
                let store = PersistentStore::new();
                for seq in 0..25 {
                    let payload = json!({"writer": writer, "seq": seq, "pad": "x".repeat(512)});
                    store.write(path.as_path(), &payload).unwrap();
                    let read: Value = store.read(path.as_path()).unwrap();
                    assert!(read.get("writer").is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let last: Value = PersistentStore::new().read(path.as_path()).unwrap();
        assert_eq!(last["seq"], 24);
        assert!(!sidecar(&path, LOCK_SUFFIX).exists());
        assert!(!sidecar(&path, TMP_SUFFIX).exists());
    }
}
