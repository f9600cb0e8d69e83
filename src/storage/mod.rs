//! Local JSON file storage
//!
//! Handles:
//! - Fallback snapshots (one file per dataset)
//! - Health metrics snapshots
//! - Optional cache backups
//!
//! Files are replaced atomically: the new content is written to a temporary
//! file in the same directory, synced, then renamed over the target. Readers
//! see either the old file or the new one, never a partial write.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::AppError;

/// Why a JSON file could not be loaded
#[derive(Debug, Error)]
pub enum JsonFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Serialize `value` to `path`, replacing any existing file atomically.
///
/// Blocking; call from `spawn_blocking` or a background task.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), AppError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".shelter-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}

/// Async wrapper running [`write_json_atomic`] on the blocking pool.
pub async fn write_json_atomic_async<T>(path: PathBuf, value: T) -> Result<(), AppError>
where
    T: Serialize + Send + 'static,
{
    tokio::task::spawn_blocking(move || write_json_atomic(&path, &value))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("file writer task failed: {e}")))?
}

/// Load `path` as JSON.
///
/// # Returns
/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, JsonFileError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(JsonFileError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| JsonFileError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}
