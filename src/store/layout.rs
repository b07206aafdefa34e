//! On-disk directory layout
//!
//! ```text
//! <root>/<node_id>/data.json   one JSON document per node
//! <root>/files/<name>          flat blob namespace
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::debug;

use super::errors::{Result, StoreError};

/// Subdirectory of the data root holding blobs
pub const FILES_DIR: &str = "files";

/// File name of a node's durable document
pub const NODE_DOCUMENT: &str = "data.json";

/// Resolves and provisions the directories used by the stores
#[derive(Debug, Clone)]
pub struct DataLayout {
    /// Data root (`data/` by default)
    root: PathBuf,
    /// Blob root (`<root>/files`)
    files_dir: PathBuf,
}

impl DataLayout {
    /// Create a layout rooted at `root`. Nothing is created until `ensure()`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let files_dir = root.join(FILES_DIR);
        Self { root, files_dir }
    }

    /// Create the data root and blob root if missing
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.root, &self.files_dir] {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// Directory holding a node's document
    pub fn node_dir(&self, node_id: &str) -> Result<PathBuf> {
        validate_node_id(node_id)?;
        Ok(self.root.join(node_id))
    }

    /// Canonical path of a node's durable document
    pub fn node_document(&self, node_id: &str) -> Result<PathBuf> {
        Ok(self.node_dir(node_id)?.join(NODE_DOCUMENT))
    }

    /// Path of a blob. `safe_name` must already be sanitized.
    pub fn blob_path(&self, safe_name: &str) -> PathBuf {
        self.files_dir.join(safe_name)
    }

    /// Remove a node's directory if it exists and is empty
    ///
    /// Returns true if the directory was removed.
    pub fn prune_node_dir(&self, node_id: &str) -> Result<bool> {
        let dir = self.node_dir(node_id)?;
        let mut entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        if entries.next().is_some() {
            return Ok(false);
        }

        match fs::remove_dir(&dir) {
            Ok(()) => {
                debug!(node = node_id, "Pruned empty node directory");
                Ok(true)
            }
            // Lost a race with another remover or a writer repopulating it
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.raw_os_error() == Some(Errno::ENOTEMPTY as i32) =>
            {
                Ok(false)
            }
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }
}

/// Reject identifiers that would resolve outside `<root>/<id>/`
///
/// Node ids are otherwise opaque. `files` is reserved for the blob root.
pub fn validate_node_id(node_id: &str) -> Result<()> {
    if node_id.is_empty() {
        return Err(StoreError::InvalidInput("empty node id".to_string()));
    }
    if node_id == "." || node_id == ".." || node_id == FILES_DIR {
        return Err(StoreError::InvalidInput(format!(
            "reserved node id: {:?}",
            node_id
        )));
    }
    if node_id.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidInput(format!(
            "node id contains a path separator: {:?}",
            node_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let layout = DataLayout::new(tmp.path().join("data"));

        layout.ensure().unwrap();
        layout.ensure().unwrap();

        assert!(layout.root().is_dir());
        assert!(layout.files_dir().is_dir());
    }

    #[test]
    fn test_node_document_path() {
        let layout = DataLayout::new("/srv/data");
        let path = layout.node_document("node-42").unwrap();
        assert_eq!(path, PathBuf::from("/srv/data/node-42/data.json"));
    }

    #[test]
    fn test_traversal_node_ids_rejected() {
        let layout = DataLayout::new("/srv/data");
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", "files", "nul\0"] {
            let err = layout.node_document(bad).unwrap_err();
            assert_eq!(err.code(), "invalidInput", "accepted {:?}", bad);
        }
        // Dots inside an id are harmless
        assert!(layout.node_document("v1..2").is_ok());
    }

    #[test]
    fn test_prune_only_removes_empty_dirs() {
        let tmp = TempDir::new().unwrap();
        let layout = DataLayout::new(tmp.path());

        assert!(!layout.prune_node_dir("missing").unwrap());

        let dir = layout.node_dir("busy").unwrap();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("other.txt"), b"x").unwrap();
        assert!(!layout.prune_node_dir("busy").unwrap());
        assert!(dir.exists());

        let empty = layout.node_dir("empty").unwrap();
        fs::create_dir_all(&empty).unwrap();
        assert!(layout.prune_node_dir("empty").unwrap());
        assert!(!empty.exists());
    }
}
