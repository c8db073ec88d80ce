//! Quarantine for work that can't complete on its own.
//!
//! Two channels share one sink:
//!
//! - **Dead letters**: items that exhausted their redelivery bound. They are
//!   never processed automatically; an operator inspects them and may replay
//!   one through the verifier.
//! - **Rejections**: commits the worker gave up on without redelivery, either
//!   because the store refused the record or because the store accepted it but
//!   the ledger couldn't be finalized.

pub mod memory;
pub mod spool;

use std::fmt;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::WorkItem;
use crate::types::MessageId;

pub use memory::MemoryDeadLetterSink;
pub use spool::SpoolDeadLetterSink;

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The message ID can't be used as a file name.
    #[error("invalid message id: {0:?}")]
    InvalidMessageId(MessageId),
}

pub type Result<T> = std::result::Result<T, DeadLetterError>;

/// A work item that exhausted redelivery, stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub item: WorkItem,
    pub delivery_count: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// The store refused the record and retrying wouldn't help.
    PermanentCommitError,
    /// The store accepted the record but the ledger still says `Claimed`.
    LedgerNotFinalized,
}

/// A commit the worker acknowledged without success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedCommit {
    pub item: WorkItem,
    pub reason: RejectionReason,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub rejected_at: DateTime<Utc>,
}

/// Durable, inspectable storage for dead letters and rejections.
///
/// Methods are synchronous: the queue calls `quarantine` while holding its
/// own lock.
pub trait DeadLetterSink: Send + Sync + fmt::Debug {
    /// Stores an entry, replacing any entry with the same message ID.
    fn quarantine(&self, entry: &DeadLetterEntry) -> Result<()>;

    /// All dead letters, oldest first.
    fn list(&self) -> Result<Vec<DeadLetterEntry>>;

    fn get(&self, message_id: &MessageId) -> Result<Option<DeadLetterEntry>>;

    /// Returns whether an entry was removed.
    fn remove(&self, message_id: &MessageId) -> Result<bool>;

    fn record_rejection(&self, rejection: &RejectedCommit) -> Result<()>;

    /// All rejections, oldest first.
    fn rejections(&self) -> Result<Vec<RejectedCommit>>;
}
