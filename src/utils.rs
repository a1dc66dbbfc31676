//! Utility functions for Backstop
//!
//! Path normalization, atomic writes, JSON index persistence, byte
//! formatting and directory walking shared by the engine components.
//!
//! ## Atomic writes
//!
//! Every file Backstop produces (artifacts, restored files, indexes) is first
//! written to a hidden temporary sibling and then renamed over the target. A
//! crash leaves either the old file or the new one, never a torn mix.
//! Temporary names carry a random suffix so concurrent writers in the same
//! directory do not collide.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::trace;
use walkdir::WalkDir;

/// Make `path` absolute against the current directory without touching the filesystem
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Hidden temporary sibling of `path`, unique per call
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    path.with_file_name(format!(".{}.{}.tmp", name, &suffix[..12]))
}

/// Write `content` to `path` atomically (temp file, then rename)
///
/// # Errors
///
/// [`BackstopError::Io`](crate::BackstopError::Io) if the temp file cannot be
/// written or renamed. The temp file is removed on failure.
pub async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = temp_sibling(path);

    if let Err(e) = tokio::fs::write(&temp_path, content).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Copy `from` to `to` atomically (temp file, then rename)
pub async fn atomic_copy(from: &Path, to: &Path) -> Result<u64> {
    let temp_path = temp_sibling(to);

    let copied = match tokio::fs::copy(from, &temp_path).await {
        Ok(n) => n,
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
    };
    if let Err(e) = tokio::fs::rename(&temp_path, to).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(copied)
}

/// Serialize `value` as pretty JSON and write it atomically
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &json).await
}

/// Load a JSON document
///
/// Returns `Ok(None)` if the file does not exist. A document that exists but
/// does not parse is reported as [`BackstopError::Json`](crate::BackstopError::Json)
/// so callers can decide whether to reinitialize.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Convert a filesystem timestamp
pub fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Regular files under `root`, sorted, skipping hidden directories
///
/// `root` itself is returned when it is a file. Walk errors (e.g. permission
/// denied on a subdirectory) are skipped.
pub fn collect_files(root: &Path) -> Vec<PathBuf> {
    if root.is_file() {
        return vec![root.to_path_buf()];
    }

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir() && e.file_name().to_string_lossy().starts_with('.'))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Format bytes as human-readable string
///
/// Binary units; values below 1024 are whole bytes.
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
