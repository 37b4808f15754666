//! Utility functions for safekeep
//!
//! This module provides the content hashing used for integrity and change
//! comparisons, the atomic write primitive every save goes through, and a few
//! small formatting helpers.
//!
//! ## File Hashing
//!
//! ```rust,ignore
//! use crate::utils::{hash_file_content, hash_data};
//! use std::path::Path;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let file_hash = hash_file_content(Path::new("settings.json"))?;
//! let data_hash = hash_data(b"Hello, world!");
//! assert_eq!(file_hash.len(), 64);
//! assert_eq!(data_hash.len(), 64);
//! # Ok(())
//! # }
//! ```
//!
//! ## Atomic Writes
//!
//! [`atomic_write_cancellable`] writes into a uniquely named temporary file in
//! the target's directory and renames it over the target. A cancelled write
//! never reaches the rename, so the target is either the old content or the new
//! content, never a partial file.

use crate::error::{Result, SafekeepError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Hash a file's content using SHA-256
///
/// Reads the file through an 8KB buffer so large files are never held in
/// memory at once.
///
/// # Returns
///
/// Returns the SHA-256 hash as a 64-character hexadecimal string.
///
/// # Errors
///
/// - [`SafekeepError::NotFound`] if the file does not exist
/// - [`SafekeepError::Io`] if I/O errors occur during reading
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| SafekeepError::from_io(e, path))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file's content on the blocking pool
pub async fn hash_file_content_async(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_content(&path))
        .await
        .map_err(|e| SafekeepError::internal(format!("hash task failed: {}", e)))?
}

/// Hash arbitrary data using SHA-256
///
/// # Example
///
/// ```rust,ignore
/// use crate::utils::hash_data;
///
/// let hash = hash_data(b"Hello, world!");
/// assert_eq!(hash.len(), 64);
/// assert_eq!(hash, hash_data(b"Hello, world!"));
/// ```
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compare two hex digests ignoring case
pub fn hashes_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Path of the temporary file used while atomically writing `path`
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "safekeep".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Atomic file write (write to temp file then rename)
///
/// Equivalent to [`atomic_write_cancellable`] with a token that is never
/// cancelled.
pub async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    atomic_write_cancellable(path, content, &CancellationToken::new()).await
}

/// Atomic file write that can be aborted
///
/// # Atomicity Guarantees
///
/// - Either the entire file is written or the previous content is kept
/// - The temporary file lives in the target's directory so the rename never
///   crosses a filesystem boundary
/// - On failure or cancellation the temporary file is removed and the target
///   is left untouched
///
/// # Errors
///
/// - [`SafekeepError::Cancelled`] if `cancel` fires before the rename
/// - [`SafekeepError::Io`] if writing or renaming fails
pub async fn atomic_write_cancellable(
    path: &Path,
    content: &[u8],
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SafekeepError::Cancelled);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let temp = TempFile::new(temp_path_for(path));

    let written = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SafekeepError::Cancelled),
        res = tokio::fs::write(&temp.path, content) => res.map_err(SafekeepError::from),
    };
    written?;
    if cancel.is_cancelled() {
        return Err(SafekeepError::Cancelled);
    }

    tokio::fs::rename(&temp.path, path).await?;
    temp.persist();
    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Temporary file that is removed on drop unless renamed into place
///
/// Covers early returns and futures dropped mid-write alike.
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn persist(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => trace!("Removed temporary file {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temporary file {:?}: {}", self.path, e),
        }
    }
}

/// Read a whole file, mapping a missing file to [`SafekeepError::NotFound`]
pub async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| SafekeepError::from_io(e, path))
}

/// Whether a path looks like a JSON document by extension
pub fn is_json_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Format bytes in human-readable form
///
/// Uses binary units (1024-based).
///
/// ```rust,ignore
/// use crate::utils::format_bytes;
///
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
