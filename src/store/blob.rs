//! Blob Store
//!
//! Flat storage of named binary files under `<data>/files/`.
//! Names are sanitized before every access, so a blob always resolves
//! directly inside the blob root.
//!
//! Puts write in place without a temp file. A reader racing a `put` of the
//! same name can observe a partially written blob.

use std::fs;
use std::io;
use std::path::Path;

use nix::unistd::{access, AccessFlags};
use sha1::{Digest, Sha1};
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;

use super::errors::{Result, StoreError};
use super::layout::DataLayout;

/// A blob read back from the store
#[derive(Debug, Clone)]
pub struct Blob {
    /// Sanitized name the blob is stored under
    pub name: String,
    /// Raw content
    pub content: Vec<u8>,
    /// Media type inferred from the name's extension
    pub media_type: &'static str,
    /// Lowercase hex SHA-1 of the content
    pub etag: String,
}

impl Blob {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Flat, name-sanitized blob storage
pub struct BlobStore {
    layout: DataLayout,
}

impl BlobStore {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    /// Store `content` under the sanitized form of `name`, replacing any
    /// existing blob with that name
    ///
    /// # Returns
    /// The sanitized name the blob was stored under
    pub fn put(&self, name: &str, content: &[u8]) -> Result<String> {
        let safe_name = sanitize_filename(name)?;
        self.layout.ensure()?;
        let path = self.layout.blob_path(&safe_name);

        match fs::remove_file(&path) {
            Ok(()) => debug!(blob = %safe_name, "Replacing existing blob"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }

        fs::write(&path, content).map_err(|e| StoreError::io(&path, e))?;

        info!(
            blob = %safe_name,
            raw_name = name,
            size = content.len(),
            "Stored blob"
        );
        Ok(safe_name)
    }

    /// Read a blob with its media type and etag
    pub fn get(&self, name: &str) -> Result<Blob> {
        let safe_name = sanitize_filename(name)?;
        let path = self.layout.blob_path(&safe_name);

        ensure_regular_file(&path, &safe_name)?;
        if access(&path, AccessFlags::R_OK).is_err() {
            return Err(StoreError::PermissionDenied(safe_name));
        }

        let content = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        let etag = format!("{:x}", Sha1::digest(&content));
        let media_type = media_type_for(&safe_name);

        debug!(
            blob = %safe_name,
            size = content.len(),
            media_type = media_type,
            "Read blob"
        );

        Ok(Blob {
            name: safe_name,
            content,
            media_type,
            etag,
        })
    }

    /// Delete a blob. Deleting a blob that does not exist is NotFound.
    pub fn delete(&self, name: &str) -> Result<()> {
        let safe_name = sanitize_filename(name)?;
        let path = self.layout.blob_path(&safe_name);

        ensure_regular_file(&path, &safe_name)?;
        fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;

        info!(blob = %safe_name, "Deleted blob");
        Ok(())
    }
}

fn ensure_regular_file(path: &Path, safe_name: &str) -> Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Err(StoreError::NotFound(safe_name.to_string())),
        Ok(_) => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Reduce an arbitrary client-supplied name to a plain filename
///
/// The name is percent-decoded and NFKD-folded so accented letters keep
/// their base letter. Remaining non-ASCII characters are dropped, path
/// separators and whitespace runs become `_`, anything outside
/// `[A-Za-z0-9_.-]` is dropped and leading/trailing `.`/`_` are trimmed.
/// Distinct inputs may map to the same name; the later put wins.
pub fn sanitize_filename(raw: &str) -> Result<String> {
    let decoded = urlencoding::decode(raw)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| raw.to_string());

    let spaced: String = decoded
        .as_str()
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let filtered: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(*c, '_' | '.' | '-'))
        .collect();
    let safe = filtered.trim_matches(|c: char| c == '.' || c == '_');

    if safe.is_empty() {
        return Err(StoreError::InvalidInput(format!(
            "filename {:?} is empty after sanitizing",
            raw
        )));
    }
    Ok(safe.to_string())
}

/// Media type for a (sanitized) blob name, from a closed extension table
pub fn media_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mp3") | Some("wav") => "audio/mpeg",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}
