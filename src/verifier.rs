//! Front half of the pipeline: validate, claim, enqueue.
//!
//! The verifier holds no state of its own. For each submission it makes one
//! conditional write to the ledger; only the caller that wins the claim
//! enqueues work, so duplicate submissions never produce a second work item.
//! If the enqueue fails the claim is released again so the caller can retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, delta};
use crate::dead_letter::{DeadLetterError, DeadLetterSink};
use crate::ledger::{ClaimOutcome, ClaimState, IdempotencyLedger, LedgerEntry, LedgerError};
use crate::queue::{NewWorkItem, QueueError, WorkQueue};
use crate::types::{ClaimId, MatchRequest, MessageId, RequestKey, TableName, ValidationError};

#[derive(Debug, Clone, Copy)]
pub struct VerifierConfig {
    /// How long a claim holds its key.
    pub claim_ttl: Duration,

    /// Delay before a new work item becomes visible to workers.
    pub initial_delay: Duration,

    /// Bound on each ledger and queue call.
    pub dependency_timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(24 * 60 * 60),
            initial_delay: Duration::from_secs(5),
            dependency_timeout: Duration::from_secs(2),
        }
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Claimed and queued for fulfillment.
    Accepted {
        key: RequestKey,
        message_id: MessageId,
        claim_id: ClaimId,
    },
    /// A live ledger entry already exists for this key.
    Duplicate { key: RequestKey, state: ClaimState },
    /// The request is malformed. Nothing was claimed or queued.
    Rejected(ValidationError),
}

/// A dependency failed; the caller may retry the same submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The claim was made but the work item couldn't be queued.
    #[error("failed to enqueue work item (claim released: {rolled_back}): {source}")]
    Queue {
        #[source]
        source: QueueError,
        /// Whether the claim was released. If not, the key stays held until
        /// its claim expires.
        rolled_back: bool,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("no dead letter with message id {0}")]
    NotFound(MessageId),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

pub struct Verifier<L, Q> {
    ledger: Arc<L>,
    queue: Arc<Q>,
    clock: Arc<dyn Clock>,
    config: VerifierConfig,
}

impl<L, Q> Verifier<L, Q>
where
    L: IdempotencyLedger,
    Q: WorkQueue,
{
    pub fn new(
        ledger: Arc<L>,
        queue: Arc<Q>,
        clock: Arc<dyn Clock>,
        config: VerifierConfig,
    ) -> Self {
        Self {
            ledger,
            queue,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Validates a raw request body and submits it.
    pub async fn submit(&self, table: &TableName, body: &[u8]) -> Result<Verdict, SubmitError> {
        match MatchRequest::parse(body) {
            Ok(request) => self.submit_request(table, request).await,
            Err(e) => {
                debug!(%table, error = %e, "Rejected invalid request");
                Ok(Verdict::Rejected(e))
            }
        }
    }

    /// Claims and enqueues an already-validated request.
    pub async fn submit_request(
        &self,
        table: &TableName,
        request: MatchRequest,
    ) -> Result<Verdict, SubmitError> {
        let key = request.key();
        let now = self.clock.now();
        let entry = LedgerEntry::claim(
            key.clone(),
            table.clone(),
            request.digest(),
            now,
            delta(self.config.claim_ttl),
        );
        let claim_id = entry.claim_id.clone();

        match self.bounded("claim", self.ledger.try_claim(entry, now)).await?? {
            ClaimOutcome::Held(existing) => {
                info!(%key, state = ?existing.state, "Duplicate request");
                return Ok(Verdict::Duplicate {
                    key,
                    state: existing.state,
                });
            }
            ClaimOutcome::Claimed => {
                debug!(%key, %claim_id, digest = %request.digest().short(), "Claimed request");
            }
        }

        let item = NewWorkItem {
            key: key.clone(),
            claim_id: claim_id.clone(),
            table: table.clone(),
            payload: request,
        };
        let enqueued = match self
            .bounded("enqueue", self.queue.enqueue(item, self.config.initial_delay))
            .await
        {
            Ok(result) => result,
            Err(timeout) => Err(QueueError::Unavailable(timeout.to_string())),
        };

        match enqueued {
            Ok(message_id) => {
                info!(%key, %message_id, %claim_id, "Accepted request");
                Ok(Verdict::Accepted {
                    key,
                    message_id,
                    claim_id,
                })
            }
            Err(source) => {
                warn!(%key, %claim_id, error = %source, "Enqueue failed, releasing claim");
                let rolled_back = self.release(&key, &claim_id).await;
                Err(SubmitError::Queue {
                    source,
                    rolled_back,
                })
            }
        }
    }

    /// Resubmits a dead-lettered request.
    ///
    /// The dead letter's own claim is released first: its work item is gone,
    /// so that claim can never be fulfilled. The entry is removed from the sink
    /// once the request is accepted again or turns out to be a duplicate.
    pub async fn replay(
        &self,
        sink: &dyn DeadLetterSink,
        message_id: &MessageId,
    ) -> Result<Verdict, ReplayError> {
        let entry = sink
            .get(message_id)?
            .ok_or_else(|| ReplayError::NotFound(message_id.clone()))?;
        let item = entry.item;

        let released = self
            .bounded("release", self.ledger.release(&item.key, &item.claim_id))
            .await?
            .map_err(SubmitError::from)?;
        debug!(%message_id, key = %item.key, released, "Replaying dead letter");

        let verdict = self.submit_request(&item.table, item.payload).await?;
        if matches!(verdict, Verdict::Accepted { .. } | Verdict::Duplicate { .. }) {
            sink.remove(message_id)?;
            info!(%message_id, key = %item.key, ?verdict, "Replayed dead letter");
        }
        Ok(verdict)
    }

    /// Releases a claim, reporting whether it is gone.
    async fn release(&self, key: &RequestKey, claim_id: &ClaimId) -> bool {
        match self.bounded("release", self.ledger.release(key, claim_id)).await {
            Ok(Ok(released)) => released,
            Ok(Err(e)) => {
                warn!(%key, %claim_id, error = %e, "Failed to release claim, it will expire");
                false
            }
            Err(e) => {
                warn!(%key, %claim_id, error = %e, "Failed to release claim, it will expire");
                false
            }
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = T>,
    ) -> Result<T, SubmitError> {
        let timeout = self.config.dependency_timeout;
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| SubmitError::Timeout { operation, timeout })
    }
}
