//! Node state caching layer
//!
//! Holds node documents in memory and debounces their durable writes so that
//! bursts of updates to one node cost a single disk write per window.

pub mod node_cache;

pub use node_cache::{CacheStats, NodeCache};
