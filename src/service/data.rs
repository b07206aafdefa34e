//! Data Service - the node and blob operations offered to clients
//!
//! Owns the node cache and blob store for one data root. Constructed once in
//! `main` and shared with the IPC server behind an `Arc`.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::cache::{CacheStats, NodeCache};
use crate::store::{Blob, BlobStore, DataLayout, Result};

/// Node documents and blobs under one data root
pub struct DataService {
    layout: DataLayout,
    nodes: NodeCache,
    blobs: BlobStore,
}

impl DataService {
    /// Open the data root, creating `<root>` and `<root>/files` if needed
    ///
    /// # Arguments
    /// * `root` - Data directory
    /// * `write_delay` - Minimum spacing between durable writes of one node
    pub fn open(root: impl Into<PathBuf>, write_delay: Duration) -> Result<Self> {
        let layout = DataLayout::new(root);
        layout.ensure()?;

        info!(
            root = %layout.root().display(),
            files = %layout.files_dir().display(),
            write_delay_ms = write_delay.as_millis() as u64,
            "Data service initialized"
        );

        Ok(Self {
            nodes: NodeCache::with_write_delay(layout.clone(), write_delay),
            blobs: BlobStore::new(layout.clone()),
            layout,
        })
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Current document of a node (`{}` for a node never written)
    pub fn get_node(&self, node_id: &str) -> Result<Value> {
        self.nodes.get(node_id)
    }

    /// Replace a node's document; persisted under the debounce policy
    pub fn set_node(&self, node_id: &str, value: Value) -> Result<()> {
        self.nodes.set(node_id, value)?;
        Ok(())
    }

    /// Forget a node in memory and on disk
    ///
    /// Succeeds when the node never existed.
    pub fn delete_node(&self, node_id: &str) -> Result<()> {
        self.nodes.delete(node_id)?;
        Ok(())
    }

    /// Store a blob, returning its sanitized name
    pub fn put_blob(&self, name: &str, content: &[u8]) -> Result<String> {
        self.blobs.put(name, content)
    }

    pub fn get_blob(&self, name: &str) -> Result<Blob> {
        self.blobs.get(name)
    }

    pub fn delete_blob(&self, name: &str) -> Result<()> {
        self.blobs.delete(name)
    }

    /// Write out one node now if it has pending changes
    pub fn flush_node(&self, node_id: &str) -> Result<bool> {
        self.nodes.flush(node_id)
    }

    /// Write out dirty nodes whose debounce window has passed
    pub fn flush_due(&self) -> usize {
        let flushed = self.nodes.flush_due();
        if flushed > 0 {
            self.nodes.log_metrics();
        }
        flushed
    }

    /// Write out every dirty node
    pub fn flush_all(&self) -> usize {
        let flushed = self.nodes.flush_all();
        info!(flushed = flushed, "Flushed all dirty nodes");
        flushed
    }

    pub fn stats(&self) -> CacheStats {
        self.nodes.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PersistentStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_service(tmp: &TempDir) -> DataService {
        DataService::open(tmp.path().join("data"), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_open_provisions_layout() {
        let tmp = TempDir::new().unwrap();
        let service = create_test_service(&tmp);

        assert!(service.layout().root().is_dir());
        assert!(service.layout().files_dir().is_dir());
    }

    #[test]
    fn test_node_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let service = create_test_service(&tmp);
        let doc = tmp.path().join("data").join("timeline").join("data.json");

        assert_eq!(service.get_node("timeline").unwrap(), json!({}));

        service.set_node("timeline", json!({"stamps": [0, 1.5]})).unwrap();
        assert!(doc.exists());
        assert_eq!(service.get_node("timeline").unwrap(), json!({"stamps": [0, 1.5]}));

        service.delete_node("timeline").unwrap();
        assert!(!doc.exists());
        assert!(!doc.parent().unwrap().exists());
        assert_eq!(service.get_node("timeline").unwrap(), json!({}));
    }

    #[test]
    fn test_delete_unknown_node_succeeds() {
        let tmp = TempDir::new().unwrap();
        let service = create_test_service(&tmp);

        service.delete_node("never-seen").unwrap();
        service.delete_node("never-seen").unwrap();
    }

    #[test]
    fn test_delete_node_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let service = create_test_service(&tmp);

        let err = service.delete_node("..").unwrap_err();
        assert_eq!(err.code(), "invalidInput");
        assert!(tmp.path().join("data").is_dir());
    }

    #[test]
    fn test_delete_discards_deferred_write() {
        let tmp = TempDir::new().unwrap();
        let service = create_test_service(&tmp);

        service.set_node("n", json!({"rev": 1})).unwrap();
        service.set_node("n", json!({"rev": 2})).unwrap();
        service.delete_node("n").unwrap();

        assert_eq!(service.flush_all(), 0);
        assert!(!tmp.path().join("data").join("n").exists());
    }

    #[test]
    fn test_blob_operations() {
        let tmp = TempDir::new().unwrap();
        let service = create_test_service(&tmp);

        let name = service.put_blob("render 01.png", b"\x89PNG").unwrap();
        assert_eq!(name, "render_01.png");

        let blob = service.get_blob("render 01.png").unwrap();
        assert_eq!(blob.media_type, "image/png");

        service.delete_blob(&name).unwrap();
        assert!(service.delete_blob(&name).unwrap_err().is_not_found());
    }

    #[test]
    fn test_flush_node_writes_pending_change() {
        let tmp = TempDir::new().unwrap();
        let service = create_test_service(&tmp);

        service.set_node("a", json!({"rev": 1})).unwrap();
        service.set_node("a", json!({"rev": 2})).unwrap();

        assert!(service.flush_node("a").unwrap());
        assert!(!service.flush_node("a").unwrap());
        assert!(!service.flush_node("untouched").unwrap());
        assert_eq!(service.stats().writes, 2);
    }

    #[test]
    fn test_flush_all_persists_deferred_writes() {
        let tmp = TempDir::new().unwrap();
        let service = create_test_service(&tmp);

        service.set_node("a", json!({"rev": 1})).unwrap();
        service.set_node("a", json!({"rev": 2})).unwrap();
        assert_eq!(service.stats().dirty, 1);

        assert_eq!(service.flush_all(), 1);
        let path = service.layout().node_document("a").unwrap();
        let on_disk: Value = PersistentStore::new().read(&path).unwrap();
        assert_eq!(on_disk, json!({"rev": 2}));
    }
}
