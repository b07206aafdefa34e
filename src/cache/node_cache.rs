//! Write-back Node Cache
//!
//! Keeps every node's JSON document resident after first use and persists
//! changes through [`PersistentStore`], at most once per `write_delay` per node.
//!
//! A `set` inside the debounce window only marks the node dirty. Dirty nodes
//! are written by the next eligible `set`, by `flush`, by the periodic
//! `flush_due` pass or by `flush_all` at shutdown.
//!
//! Locking:
//! - `write_state` is the cache-wide critical section. `set`, `flush`,
//!   `delete`, `flush_due` and `flush_all` hold it for their whole duration,
//!   including the synchronous disk write or removal, so at most one durable
//!   change is in flight across all nodes.
//! - `values` only guards the in-memory map and is never held across I/O.
//!   `get` does not enter the critical section: it can return a value that a
//!   concurrent `set` is about to replace, or re-seed a node that a concurrent
//!   `delete` just dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::store::{DataLayout, PersistentStore, Result};

/// Default minimum spacing between durable writes of one node
pub const DEFAULT_WRITE_DELAY: Duration = Duration::from_secs(5);

/// Dirty set and last-write timestamps
#[derive(Default)]
struct WriteState {
    dirty: HashSet<String>,
    last_write: HashMap<String, Instant>,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Nodes currently held in memory
    pub resident: usize,
    /// Nodes with changes not yet on disk
    pub dirty: usize,
    /// `get` calls answered from memory
    pub hits: u64,
    /// `get` calls that went to disk
    pub misses: u64,
    /// Durable writes completed
    pub writes: u64,
    /// `set` calls that left the node dirty inside its debounce window
    pub deferred_writes: u64,
    /// Total bytes of JSON written
    pub bytes_written: u64,
    /// Durable writes that failed
    pub write_failures: u64,
}

/// In-memory node documents with debounced write-back
pub struct NodeCache {
    layout: DataLayout,
    store: PersistentStore,
    write_delay: Duration,
    /// Resident node values by id
    values: RwLock<HashMap<String, Value>>,
    /// Cache-wide critical section for mutation and flushing
    write_state: Mutex<WriteState>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deferred: AtomicU64,
    bytes_written: AtomicU64,
    write_failures: AtomicU64,
}

impl NodeCache {
    /// Create a cache with a custom write delay
    ///
    /// # Arguments
    /// * `layout` - Where node documents live
    /// * `write_delay` - Minimum spacing between durable writes of one node
    pub fn with_write_delay(layout: DataLayout, write_delay: Duration) -> Self {
        Self {
            layout,
            store: PersistentStore::new(),
            write_delay,
            values: RwLock::new(HashMap::new()),
            write_state: Mutex::new(WriteState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Get a node's document, loading it from disk on first access
    ///
    /// A node with no (or corrupt) durable document is seeded with `{}`.
    pub fn get(&self, node_id: &str) -> Result<Value> {
        if let Some(value) = self.read_values().get(node_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(node = node_id, "Node cache HIT");
            return Ok(value.clone());
        }

        let path = self.layout.node_document(node_id)?;
        self.misses.fetch_add(1, Ordering::Relaxed);

        let loaded = match self.store.read::<Value>(&path) {
            Ok(value) => {
                debug!(node = node_id, "Node cache MISS, loaded from disk");
                value
            }
            Err(e) if e.is_not_found() => {
                debug!(node = node_id, "Node cache MISS, seeding empty document");
                Value::Object(Map::new())
            }
            Err(e) => return Err(e),
        };

        // A set that landed while we were reading wins
        let mut values = self.write_values();
        Ok(values.entry(node_id.to_string()).or_insert(loaded).clone())
    }

    /// Replace a node's document
    ///
    /// Writes through immediately if the node's last durable write is at
    /// least `write_delay` old (or it was never written); otherwise the node
    /// is left dirty.
    ///
    /// # Returns
    /// true if the document was written to disk before returning
    pub fn set(&self, node_id: &str, value: Value) -> Result<bool> {
        self.layout.node_document(node_id)?;

        let mut state = self.lock_write_state();
        self.write_values().insert(node_id.to_string(), value);
        state.dirty.insert(node_id.to_string());

        if self.window_elapsed(&state, node_id) {
            self.flush_locked(&mut state, node_id)
        } else {
            self.deferred.fetch_add(1, Ordering::Relaxed);
            debug!(node = node_id, "Write deferred inside debounce window");
            Ok(false)
        }
    }

    /// Write a node's document to disk if it is dirty
    ///
    /// # Returns
    /// true if a durable write happened
    pub fn flush(&self, node_id: &str) -> Result<bool> {
        let mut state = self.lock_write_state();
        self.flush_locked(&mut state, node_id)
    }

    /// Forget a node: drop its resident value, dirty flag and write
    /// timestamp, remove its durable document and prune its directory
    ///
    /// All of it happens inside the critical section, so a concurrent `set`
    /// of the same node lands either wholly before or wholly after.
    ///
    /// # Returns
    /// true if a durable document was removed
    pub fn delete(&self, node_id: &str) -> Result<bool> {
        let path = self.layout.node_document(node_id)?;

        let mut state = self.lock_write_state();
        let was_resident = self.write_values().remove(node_id).is_some();
        let was_dirty = state.dirty.remove(node_id);
        state.last_write.remove(node_id);

        let removed = self.store.remove(&path)?;
        self.layout.prune_node_dir(node_id)?;

        debug!(
            node = node_id,
            was_resident = was_resident,
            discarded_dirty = was_dirty,
            removed_document = removed,
            "Deleted node"
        );
        Ok(removed)
    }

    /// Flush every dirty node whose debounce window has elapsed
    ///
    /// # Returns
    /// Number of nodes written
    pub fn flush_due(&self) -> usize {
        let mut state = self.lock_write_state();
        let due: Vec<String> = state
            .dirty
            .iter()
            .filter(|id| self.window_elapsed(&state, id))
            .cloned()
            .collect();
        self.flush_each(&mut state, due)
    }

    /// Flush every dirty node regardless of its debounce window
    ///
    /// # Returns
    /// Number of nodes written
    pub fn flush_all(&self) -> usize {
        let mut state = self.lock_write_state();
        let dirty: Vec<String> = state.dirty.iter().cloned().collect();
        self.flush_each(&mut state, dirty)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let dirty = self.lock_write_state().dirty.len();
        CacheStats {
            resident: self.read_values().len(),
            dirty,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deferred_writes: self.deferred.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let stats = self.stats();
        let lookups = stats.hits + stats.misses;
        let hit_rate = if lookups > 0 {
            (stats.hits as f64 / lookups as f64) * 100.0
        } else {
            0.0
        };

        debug!(
            resident = stats.resident,
            dirty = stats.dirty,
            hit_rate = format!("{:.1}%", hit_rate),
            writes = stats.writes,
            deferred = stats.deferred_writes,
            bytes_written = stats.bytes_written,
            write_failures = stats.write_failures,
            "Node cache metrics"
        );
    }

    fn window_elapsed(&self, state: &WriteState, node_id: &str) -> bool {
        state
            .last_write
            .get(node_id)
            .map_or(true, |at| at.elapsed() >= self.write_delay)
    }

    /// Caller holds the critical section. A failed write leaves the node dirty.
    fn flush_locked(&self, state: &mut WriteState, node_id: &str) -> Result<bool> {
        if !state.dirty.contains(node_id) {
            return Ok(false);
        }

        let value = match self.read_values().get(node_id) {
            Some(value) => value.clone(),
            None => {
                state.dirty.remove(node_id);
                return Ok(false);
            }
        };

        let path = self.layout.node_document(node_id)?;
        match self.store.write(&path, &value) {
            Ok(bytes) => {
                state.dirty.remove(node_id);
                state.last_write.insert(node_id.to_string(), Instant::now());
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                debug!(node = node_id, bytes = bytes, "Flushed node");
                Ok(true)
            }
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn flush_each(&self, state: &mut WriteState, node_ids: Vec<String>) -> usize {
        let mut flushed = 0;
        for node_id in node_ids {
            match self.flush_locked(state, &node_id) {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => warn!(node = %node_id, error = %e, "Failed to flush node"),
            }
        }
        flushed
    }

    fn lock_write_state(&self) -> MutexGuard<'_, WriteState> {
        self.write_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_values(&self) -> RwLockReadGuard<'_, HashMap<String, Value>> {
        self.values.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_values(&self) -> RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.values.write().unwrap_or_else(PoisonError::into_inner)
    }
}
