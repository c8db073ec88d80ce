//! Processing of a single work item.
//!
//! [`Fulfiller::process`] decides what a delivery should do and performs the
//! external commit. It never touches the queue; the caller acks or nacks based
//! on the returned [`Fulfillment`].
//!
//! Processing has two phases. [`Fulfiller::check`] only reads the ledger and
//! may be abandoned at any point. [`Fulfiller::commit_and_finalize`] talks to
//! the store and must run to completion once started, otherwise the record can
//! reach the store while the ledger still says `Claimed`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::dead_letter::{DeadLetterSink, RejectedCommit, RejectionReason};
use crate::ledger::{ClaimState, CommitTransition, IdempotencyLedger, LedgerError};
use crate::queue::WorkItem;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::store::{CommitError, CommitReceipt, RecordStore};
use crate::types::StoreRecords;

#[derive(Debug, Clone, Copy)]
pub struct FulfillerConfig {
    /// Bound on one commit call to the external store.
    pub store_timeout: Duration,

    /// Bound on each ledger call.
    pub dependency_timeout: Duration,

    /// Backoff for finalizing the ledger after a successful commit.
    pub finalize_retry: RetryConfig,
}

impl FulfillerConfig {
    /// Longest a delivery can spend between receipt and a finalized ledger:
    /// the ledger read, the store call, then every finalize attempt and the
    /// backoff between them. A lease shorter than this can lapse while the
    /// record is being written.
    pub fn max_processing_time(&self) -> Duration {
        let ledger_calls = self.finalize_retry.max_retries.saturating_add(2);
        self.dependency_timeout
            .saturating_mul(ledger_calls)
            .saturating_add(self.store_timeout)
            .saturating_add(self.finalize_retry.total_max_wait())
    }
}

/// Why a delivery was treated as a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    /// No ledger entry for the key.
    Missing,
    /// The claim expired before the item was processed.
    Expired,
    /// The key has been claimed again since this item was enqueued.
    Superseded,
    /// The commit already happened.
    AlreadyCommitted,
}

/// What a delivery achieved. Everything except `Retryable` is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fulfillment {
    /// The store accepted the record.
    ///
    /// `ledger_finalized` is false when the ledger entry couldn't be moved to
    /// `Committed`; the entry then stays `Claimed` until it expires.
    Committed { ledger_finalized: bool },

    /// Nothing to do.
    Duplicate(DuplicateReason),

    /// A dependency failed in a way redelivery may fix.
    Retryable(String),

    /// The store refused the record. Recorded for operators.
    Fatal(String),
}

impl Fulfillment {
    pub fn should_ack(&self) -> bool {
        !matches!(self, Fulfillment::Retryable(_))
    }
}

pub struct Fulfiller<L, S> {
    ledger: Arc<L>,
    store: Arc<S>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: FulfillerConfig,
}

impl<L, S> Fulfiller<L, S>
where
    L: IdempotencyLedger,
    S: RecordStore,
{
    pub fn new(
        ledger: Arc<L>,
        store: Arc<S>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
        config: FulfillerConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            dead_letters,
            clock,
            config,
        }
    }

    pub async fn process(&self, item: &WorkItem) -> Fulfillment {
        match self.check(item).await {
            Ok(()) => self.commit_and_finalize(item).await,
            Err(skip) => skip,
        }
    }

    /// Decides whether `item` should be committed. `Err` carries the outcome
    /// for an item that must not reach the store.
    pub async fn check(&self, item: &WorkItem) -> Result<(), Fulfillment> {
        let key = &item.key;

        let timeout = self.config.dependency_timeout;
        let entry = match tokio::time::timeout(timeout, self.ledger.get(key)).await {
            Ok(Ok(entry)) => entry,
            Ok(Err(e)) => {
                return Err(Fulfillment::Retryable(format!("ledger read failed: {e}")));
            }
            Err(_) => {
                return Err(Fulfillment::Retryable(format!(
                    "ledger read timed out after {timeout:?}"
                )));
            }
        };

        let Some(entry) = entry else {
            debug!(%key, "No ledger entry, skipping");
            return Err(Fulfillment::Duplicate(DuplicateReason::Missing));
        };
        if entry.claim_id != item.claim_id {
            debug!(
                %key,
                current = %entry.claim_id,
                stale = %item.claim_id,
                "Claim superseded, skipping"
            );
            return Err(Fulfillment::Duplicate(DuplicateReason::Superseded));
        }
        if entry.state == ClaimState::Committed {
            debug!(%key, "Already committed, skipping");
            return Err(Fulfillment::Duplicate(DuplicateReason::AlreadyCommitted));
        }
        if !entry.is_live(self.clock.now()) {
            warn!(
                %key,
                expired_at = %entry.expires_at,
                "Claim expired before fulfillment, skipping"
            );
            return Err(Fulfillment::Duplicate(DuplicateReason::Expired));
        }

        Ok(())
    }

    /// Commits `item` to the store and moves its ledger entry to `Committed`.
    ///
    /// Bounded by the store timeout plus the finalize retry budget. Callers
    /// must not drop the future early.
    pub async fn commit_and_finalize(&self, item: &WorkItem) -> Fulfillment {
        let key = &item.key;
        match self.commit(item).await {
            Ok(receipt) => {
                info!(%key, records = ?receipt.record_ids, "Committed to store");
                self.finalize(item).await
            }
            Err(e) if e.is_retriable() => {
                warn!(%key, error = %e, "Transient commit failure");
                Fulfillment::Retryable(e.to_string())
            }
            Err(e) => {
                error!(%key, error = %e, "Store rejected record");
                self.record_rejection(
                    item,
                    RejectionReason::PermanentCommitError,
                    &e.to_string(),
                    e.status_code,
                );
                Fulfillment::Fatal(e.to_string())
            }
        }
    }

    async fn commit(&self, item: &WorkItem) -> Result<CommitReceipt, CommitError> {
        let records = StoreRecords::for_request(&item.payload);
        let timeout = self.config.store_timeout;
        match tokio::time::timeout(timeout, self.store.commit_record(&item.table, &records)).await {
            Ok(result) => result,
            Err(_) => Err(CommitError::transient(format!(
                "store call timed out after {timeout:?}"
            ))),
        }
    }

    /// Moves the ledger entry to `Committed` after the store accepted the
    /// record. The delivery is acknowledged whatever happens here: redelivery
    /// would write the record a second time.
    async fn finalize(&self, item: &WorkItem) -> Fulfillment {
        let ledger = &self.ledger;
        let clock = &self.clock;
        let key = &item.key;
        let claim_id = &item.claim_id;
        let dependency_timeout = self.config.dependency_timeout;

        let result = retry_with_backoff(self.config.finalize_retry, move || async move {
            match tokio::time::timeout(
                dependency_timeout,
                ledger.mark_committed(key, claim_id, clock.now()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LedgerError::Unavailable(format!(
                    "mark_committed timed out after {dependency_timeout:?}"
                ))),
            }
        })
        .await
        .into_result();

        let problem = match result {
            Ok(CommitTransition::Committed | CommitTransition::AlreadyCommitted) => {
                return Fulfillment::Committed {
                    ledger_finalized: true,
                };
            }
            Ok(CommitTransition::ClaimLost) => {
                "claim expired or was replaced before the ledger was finalized".to_string()
            }
            Err(e) => format!("failed to finalize ledger: {e}"),
        };

        error!(%key, %claim_id, problem = %problem, "Record committed but ledger not finalized");
        self.record_rejection(item, RejectionReason::LedgerNotFinalized, &problem, None);
        Fulfillment::Committed {
            ledger_finalized: false,
        }
    }

    fn record_rejection(
        &self,
        item: &WorkItem,
        reason: RejectionReason,
        error: &str,
        status_code: Option<u16>,
    ) {
        let rejection = RejectedCommit {
            item: item.clone(),
            reason,
            error: error.to_string(),
            status_code,
            rejected_at: self.clock.now(),
        };
        if let Err(e) = self.dead_letters.record_rejection(&rejection) {
            error!(
                key = %item.key,
                message_id = %item.message_id,
                error = %e,
                "Failed to record rejection"
            );
        }
    }
}
