//! Versioned JSON snapshots of in-process store state.
//!
//! The ledger and the work queue keep their full state in memory and, when a
//! snapshot path is configured, rewrite it after every mutation. Snapshots are
//! written with [`write_atomic`] and wrapped in an envelope carrying a schema
//! version and the time of the write.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fsync::write_atomic;

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema version mismatch.
    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    state: T,
}

/// Saves `state` atomically to `path`.
///
/// `state` is serialized on the calling task; the write and fsyncs run on the
/// blocking pool so callers holding an async lock don't stall a runtime thread.
pub async fn save_snapshot<T: Serialize>(path: &Path, state: &T) -> Result<()> {
    let envelope = Envelope {
        schema_version: SCHEMA_VERSION,
        saved_at: Utc::now(),
        state,
    };
    let bytes = serde_json::to_vec_pretty(&envelope)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
        .await
        .map_err(io::Error::other)??;
    Ok(())
}

/// Loads a snapshot, returning `None` if the file doesn't exist.
///
/// Malformed JSON and schema mismatches are errors: starting from an empty
/// state would silently forget claims and queued work.
pub fn try_load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let envelope: Envelope<T> = serde_json::from_slice(&bytes)?;
    if envelope.schema_version != SCHEMA_VERSION {
        return Err(SnapshotError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: envelope.schema_version,
        });
    }

    Ok(Some(envelope.state))
}
