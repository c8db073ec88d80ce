//! Idempotency ledger.
//!
//! The ledger records, per logical request key, whether the request has been
//! claimed for processing or committed to the external store. Every entry has
//! an expiry; once it passes the entry is logically absent and the key can be
//! claimed again.
//!
//! ```text
//! Absent -> Claimed -> Committed -> Absent (expiry)
//!              \-----------------> Absent (expiry or rollback)
//! ```
//!
//! All mutations are conditional so that concurrent verifiers and workers
//! coordinate only through the ledger:
//!
//! - [`IdempotencyLedger::try_claim`] creates an entry only if no live one exists
//! - [`IdempotencyLedger::mark_committed`] and [`IdempotencyLedger::release`]
//!   only touch the entry of the claim they name

pub mod local;

use std::future::Future;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::SnapshotError;
use crate::retry::Retriable;
use crate::types::{ClaimId, PayloadDigest, RequestKey, TableName};

pub use local::LocalLedger;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The backing store can't be reached.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The change could not be made durable and was rolled back.
    #[error("failed to persist ledger: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl Retriable for LedgerError {
    fn is_retriable(&self) -> bool {
        true
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    /// Accepted and waiting for (or undergoing) fulfillment.
    Claimed,
    /// The external store accepted the record.
    Committed,
}

/// The ledger's record for one request key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: RequestKey,
    pub claim_id: ClaimId,
    pub state: ClaimState,
    pub table: TableName,
    pub payload_digest: PayloadDigest,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// A fresh `Claimed` entry with a new claim ID, held for `hold`.
    pub fn claim(
        key: RequestKey,
        table: TableName,
        payload_digest: PayloadDigest,
        now: DateTime<Utc>,
        hold: TimeDelta,
    ) -> Self {
        Self {
            key,
            claim_id: ClaimId::generate(),
            state: ClaimState::Claimed,
            table,
            payload_digest,
            claimed_at: now,
            expires_at: now.checked_add_signed(hold).unwrap_or(DateTime::<Utc>::MAX_UTC),
            committed_at: None,
        }
    }

    /// Whether the entry still counts at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Result of [`IdempotencyLedger::try_claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The entry was written; the caller owns the claim.
    Claimed,
    /// A live entry already exists.
    Held(LedgerEntry),
}

/// Result of [`IdempotencyLedger::mark_committed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTransition {
    /// `Claimed` became `Committed`.
    Committed,
    /// This claim was already `Committed`.
    AlreadyCommitted,
    /// The entry is gone or belongs to a different claim.
    ClaimLost,
}

/// A strongly-consistent key-value store of [`LedgerEntry`] values.
pub trait IdempotencyLedger: Send + Sync {
    /// Writes `entry` only if no live entry exists for its key.
    ///
    /// An expired entry is replaced.
    fn try_claim(
        &self,
        entry: LedgerEntry,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<ClaimOutcome>> + Send;

    /// Returns the stored entry, live or not.
    fn get(&self, key: &RequestKey) -> impl Future<Output = Result<Option<LedgerEntry>>> + Send;

    /// Moves the entry for `claim_id` from `Claimed` to `Committed`.
    ///
    /// The expiry is left unchanged.
    fn mark_committed(
        &self,
        key: &RequestKey,
        claim_id: &ClaimId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<CommitTransition>> + Send;

    /// Deletes the entry if it is still `Claimed` by `claim_id`.
    ///
    /// Returns whether an entry was removed.
    fn release(
        &self,
        key: &RequestKey,
        claim_id: &ClaimId,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Drops every entry that has expired at `now`. Returns the number dropped.
    fn purge_expired(&self, now: DateTime<Utc>) -> impl Future<Output = Result<usize>> + Send;
}
