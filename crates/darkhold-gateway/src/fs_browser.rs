//! Filesystem browser collaborator.
//!
//! The browser UI picks working directories through `GET /api/fs/list`.
//! Listings are confined to the configured base path: the requested path is
//! canonicalized and must stay inside the canonicalized base, otherwise the
//! request is rejected as forbidden.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;

use crate::error::GatewayError;

/// One directory entry in a listing.
#[derive(Debug, Serialize)]
pub struct FsEntry {
    /// File or directory name.
    pub name: String,
    /// Absolute path, usable as a follow-up `path` parameter.
    pub path: String,
    /// Whether the entry is a directory.
    #[serde(rename = "isDir")]
    pub is_dir: bool,
    /// Size in bytes; omitted for directories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Last modification time, RFC 3339; omitted when unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

/// List the directory at `requested` (default: the base itself), confined
/// to `base`.
///
/// Returns the canonical path that was listed plus its entries, sorted
/// directories-first then by name.
///
/// # Errors
///
/// [`GatewayError::NotFound`] for missing paths,
/// [`GatewayError::Forbidden`] for escapes outside the base,
/// [`GatewayError::BadRequest`] when the path is not a directory.
pub async fn list_dir(
    base: &Path,
    requested: Option<&str>,
) -> Result<(PathBuf, Vec<FsEntry>), GatewayError> {
    let target = match requested {
        Some(p) if !p.trim().is_empty() => {
            let p = Path::new(p);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        }
        _ => base.to_path_buf(),
    };

    let base = fs::canonicalize(base)
        .await
        .map_err(|e| GatewayError::Internal(format!("base path unavailable: {e}")))?;
    let target = fs::canonicalize(&target)
        .await
        .map_err(|_| GatewayError::NotFound)?;

    if !target.starts_with(&base) {
        return Err(GatewayError::Forbidden);
    }

    let metadata = fs::metadata(&target)
        .await
        .map_err(|_| GatewayError::NotFound)?;
    if !metadata.is_dir() {
        return Err(GatewayError::BadRequest(format!(
            "not a directory: {}",
            target.display()
        )));
    }

    let mut entries = Vec::new();
    let mut reader = fs::read_dir(&target)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to read directory: {e}")))?;
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to read directory: {e}")))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let is_dir = metadata.is_dir();
        let modified = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
        entries.push(FsEntry {
            path: entry.path().to_string_lossy().to_string(),
            name,
            is_dir,
            size: (!is_dir).then(|| metadata.len()),
            modified,
        });
    }

    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    Ok((target, entries))
}
