//! Durable storage: atomic JSON documents, flat blobs, directory layout

pub mod blob;
pub mod errors;
pub mod layout;
pub mod persistent;

pub use blob::{Blob, BlobStore};
pub use errors::{Result, StoreError};
pub use layout::DataLayout;
pub use persistent::PersistentStore;
