//! Queue consumers.
//!
//! A [`Worker`] repeatedly receives one delivery, hands it to the
//! [`Fulfiller`], and acks or nacks depending on the outcome. Workers share
//! nothing but the queue, the ledger and the store, so any number of them can
//! run side by side.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use super::fulfill::{Fulfiller, Fulfillment};
use super::poll::PollConfig;
use crate::ledger::IdempotencyLedger;
use crate::queue::{self, Delivery, NackOutcome, QueueError, WorkQueue};
use crate::store::RecordStore;

/// Reason recorded when shutdown interrupts processing.
pub const INTERRUPTED: &str = "interrupted by shutdown";

/// What one [`Worker::run_once`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was visible.
    Idle,
    /// Processed and acknowledged.
    Acked(Fulfillment),
    /// Returned to the queue or dead-lettered.
    Nacked { reason: String, outcome: NackOutcome },
    /// Shutdown arrived before the store call; the item was returned to the
    /// queue.
    Interrupted(NackOutcome),
}

pub struct Worker<L, Q, S> {
    id: usize,
    queue: Arc<Q>,
    fulfiller: Arc<Fulfiller<L, S>>,
    poll: PollConfig,
    dependency_timeout: Duration,
}

impl<L, Q, S> Worker<L, Q, S>
where
    L: IdempotencyLedger,
    Q: WorkQueue,
    S: RecordStore,
{
    pub fn new(
        id: usize,
        queue: Arc<Q>,
        fulfiller: Arc<Fulfiller<L, S>>,
        poll: PollConfig,
        dependency_timeout: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            fulfiller,
            poll,
            dependency_timeout,
        }
    }

    /// Receives and handles at most one delivery.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> queue::Result<RunOutcome> {
        let received = self.bounded(self.queue.receive()).await??;
        let Some(delivery) = received else {
            return Ok(RunOutcome::Idle);
        };
        self.handle(delivery, shutdown).await
    }

    /// Runs until `shutdown` is cancelled.
    #[instrument(skip(self, shutdown), fields(worker = self.id))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Worker started");

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.poll.initial_delay(self.id)) => {}
        }

        while !shutdown.is_cancelled() {
            let idle = match self.run_once(&shutdown).await {
                Ok(RunOutcome::Idle) => true,
                Ok(outcome) => {
                    debug!(?outcome, "Handled delivery");
                    false
                }
                Err(e) => {
                    error!(error = %e, "Queue error");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll.idle_delay(self.id)) => {}
                }
            }
        }

        info!("Worker stopped");
    }

    async fn handle(
        &self,
        delivery: Delivery,
        shutdown: &CancellationToken,
    ) -> queue::Result<RunOutcome> {
        let Delivery { item, lease } = delivery;
        let span = info_span!(
            "delivery",
            message_id = %item.message_id,
            key = %item.key,
            delivery_count = item.delivery_count,
        );

        async move {
            let checked = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                checked = self.fulfiller.check(&item) => Some(checked),
            };

            let Some(checked) = checked else {
                let outcome = self.bounded(self.queue.nack(&lease, INTERRUPTED)).await??;
                info!(?outcome, "Processing interrupted by shutdown");
                return Ok(RunOutcome::Interrupted(outcome));
            };

            // Once the store call starts, shutdown waits for it and for the
            // ledger update so the outcome is acked.
            let fulfillment = match checked {
                Ok(()) => self.fulfiller.commit_and_finalize(&item).await,
                Err(skip) => skip,
            };

            if fulfillment.should_ack() {
                self.bounded(self.queue.ack(&lease)).await??;
                debug!(?fulfillment, "Acknowledged");
                return Ok(RunOutcome::Acked(fulfillment));
            }

            let reason = match &fulfillment {
                Fulfillment::Retryable(reason) => reason.clone(),
                other => format!("{other:?}"),
            };
            let outcome = self.bounded(self.queue.nack(&lease, &reason)).await??;
            match outcome {
                NackOutcome::DeadLettered => {
                    warn!(reason = %reason, "Redelivery exhausted, item dead-lettered");
                }
                NackOutcome::Redeliver { visible_at } => {
                    debug!(reason = %reason, %visible_at, "Returned for redelivery");
                }
            }
            Ok(RunOutcome::Nacked { reason, outcome })
        }
        .instrument(span)
        .await
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = T>,
    ) -> Result<T, QueueError> {
        tokio::time::timeout(self.dependency_timeout, fut)
            .await
            .map_err(|_| {
                QueueError::Unavailable(format!(
                    "queue call timed out after {:?}",
                    self.dependency_timeout
                ))
            })
    }
}

/// Spawns `count` workers sharing one queue and fulfiller.
pub fn spawn_workers<L, Q, S>(
    count: usize,
    queue: Arc<Q>,
    fulfiller: Arc<Fulfiller<L, S>>,
    poll: PollConfig,
    dependency_timeout: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>>
where
    L: IdempotencyLedger + 'static,
    Q: WorkQueue + 'static,
    S: RecordStore + 'static,
{
    (0..count)
        .map(|id| {
            let worker = Worker::new(
                id,
                queue.clone(),
                fulfiller.clone(),
                poll,
                dependency_timeout,
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
