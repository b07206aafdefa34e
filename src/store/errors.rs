//! Store Error Types
//!
//! Structured error handling for node documents and blobs.
//! Maps filesystem failures to the small taxonomy callers act on.

use std::io;
use std::path::{Path, PathBuf};

/// Store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O failure on {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Wrap an I/O error, keeping NotFound and PermissionDenied distinguishable
    pub fn io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(path.display().to_string()),
            io::ErrorKind::PermissionDenied => {
                StoreError::PermissionDenied(path.display().to_string())
            }
            _ => StoreError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    /// Map store error to the wire code reported to IPC clients
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "notFound",
            StoreError::InvalidInput(_) => "invalidInput",
            StoreError::PermissionDenied(_) => "permissionDenied",
            StoreError::Io { .. } => "ioFailure",
            StoreError::Serialization(_) => "ioFailure",
        }
    }

    /// Whether this error means the target simply does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
