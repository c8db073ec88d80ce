//! Filesystem dead-letter sink.
//!
//! # Directory Layout
//!
//! ```text
//! <root>/
//!   dead-letter/
//!     <message-id>.json                   # one DeadLetterEntry
//!   rejected/
//!     <message-id>.<millis>.<ulid>.json   # one RejectedCommit per rejection
//! ```
//!
//! Every file is written with [`write_atomic`], so a crash leaves either the
//! old file, the new file, or a stray `.tmp` that listing ignores.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::warn;
use ulid::Ulid;

use super::{DeadLetterEntry, DeadLetterError, DeadLetterSink, RejectedCommit, Result};
use crate::persistence::write_atomic;
use crate::types::MessageId;

pub const DEAD_LETTER_DIR: &str = "dead-letter";
pub const REJECTED_DIR: &str = "rejected";

/// Validates that a message ID is safe to use as a file name.
///
/// Rejects IDs that could escape the spool directory or produce hidden files.
fn validate_message_id(message_id: &MessageId) -> Result<()> {
    let id = message_id.as_str();
    let unsafe_id = id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\', '\0']);
    if unsafe_id {
        return Err(DeadLetterError::InvalidMessageId(message_id.clone()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SpoolDeadLetterSink {
    dead_letter_dir: PathBuf,
    rejected_dir: PathBuf,
}

impl SpoolDeadLetterSink {
    /// Creates a sink rooted at `root`. Directories are created on first write.
    pub fn new(root: &Path) -> Self {
        Self {
            dead_letter_dir: root.join(DEAD_LETTER_DIR),
            rejected_dir: root.join(REJECTED_DIR),
        }
    }

    fn entry_path(&self, message_id: &MessageId) -> Result<PathBuf> {
        validate_message_id(message_id)?;
        Ok(self
            .dead_letter_dir
            .join(format!("{}.json", message_id.as_str())))
    }
}

/// Reads every `*.json` file in `dir`. A missing directory is empty.
///
/// Unreadable files are skipped with a warning so one corrupt entry doesn't
/// hide the rest.
fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut items = Vec::new();
    for dir_entry in read_dir {
        let path = dir_entry?.path();
        if path.extension() != Some(OsStr::new("json")) {
            continue;
        }
        let parsed = std::fs::read(&path)
            .map_err(DeadLetterError::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(DeadLetterError::from));
        match parsed {
            Ok(item) => items.push(item),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable spool file"),
        }
    }
    Ok(items)
}

impl DeadLetterSink for SpoolDeadLetterSink {
    fn quarantine(&self, entry: &DeadLetterEntry) -> Result<()> {
        let path = self.entry_path(&entry.item.message_id)?;
        let bytes = serde_json::to_vec_pretty(entry)?;
        write_atomic(&path, &bytes)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> = read_all(&self.dead_letter_dir)?;
        entries.sort_by_key(|e| e.dead_lettered_at);
        Ok(entries)
    }

    fn get(&self, message_id: &MessageId) -> Result<Option<DeadLetterEntry>> {
        let path = self.entry_path(message_id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, message_id: &MessageId) -> Result<bool> {
        let path = self.entry_path(message_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn record_rejection(&self, rejection: &RejectedCommit) -> Result<()> {
        validate_message_id(&rejection.item.message_id)?;
        let path = self.rejected_dir.join(format!(
            "{}.{}.{}.json",
            rejection.item.message_id.as_str(),
            rejection.rejected_at.timestamp_millis(),
            Ulid::new()
        ));
        let bytes = serde_json::to_vec_pretty(rejection)?;
        write_atomic(&path, &bytes)?;
        Ok(())
    }

    fn rejections(&self) -> Result<Vec<RejectedCommit>> {
        let mut rejections: Vec<RejectedCommit> = read_all(&self.rejected_dir)?;
        rejections.sort_by_key(|r| r.rejected_at);
        Ok(rejections)
    }
}
