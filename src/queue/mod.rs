//! Delayed, at-least-once work queue.
//!
//! Items become visible once their delay has elapsed. A `receive` hands one
//! visible item to the caller under a lease; until the lease ends no other
//! consumer can see it. `ack` destroys the item, `nack` (or letting the lease
//! lapse) makes it visible again once the lease window is over. Each receive
//! counts as a delivery; an item that fails its last allowed delivery is moved
//! to the dead-letter sink instead of being redelivered.

pub mod local;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dead_letter::DeadLetterError;
use crate::persistence::SnapshotError;
use crate::types::{ClaimId, LeaseToken, MatchRequest, MessageId, RequestKey, TableName};

pub use local::{LocalWorkQueue, QueueConfig};

#[derive(Debug, Error)]
pub enum QueueError {
    /// The lease expired or was never granted; the item may now belong to
    /// another consumer.
    #[error("lease for message {0} is no longer held")]
    LeaseLost(MessageId),

    #[error("queue is full ({capacity} items)")]
    Full { capacity: usize },

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("failed to persist queue: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("dead-letter sink failed: {0}")]
    DeadLetter(#[from] DeadLetterError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// An item to enqueue. The queue assigns the message ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkItem {
    pub key: RequestKey,
    pub claim_id: ClaimId,
    pub table: TableName,
    pub payload: MatchRequest,
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub message_id: MessageId,
    pub key: RequestKey,
    /// The claim this item was enqueued under.
    pub claim_id: ClaimId,
    pub table: TableName,
    pub payload: MatchRequest,
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries so far, including the current one while leased.
    pub delivery_count: u32,
}

/// Exclusive visibility of one item for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub message_id: MessageId,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub item: WorkItem,
    pub lease: Lease,
}

/// What happened to a negatively acknowledged item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The item will be delivered again, no earlier than `visible_at`.
    Redeliver { visible_at: DateTime<Utc> },
    /// The delivery bound was reached; the item is in the dead-letter sink.
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Visible now.
    pub ready: usize,
    /// Waiting for an initial delay or a lease window to end.
    pub delayed: usize,
    /// Leased to a consumer.
    pub in_flight: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.ready + self.delayed + self.in_flight
    }
}

pub trait WorkQueue: Send + Sync {
    /// Adds an item that becomes visible after `delay`.
    fn enqueue(
        &self,
        item: NewWorkItem,
        delay: Duration,
    ) -> impl Future<Output = Result<MessageId>> + Send;

    /// Leases one visible item, if any.
    fn receive(&self) -> impl Future<Output = Result<Option<Delivery>>> + Send;

    /// Destroys the leased item.
    fn ack(&self, lease: &Lease) -> impl Future<Output = Result<()>> + Send;

    /// Returns the leased item for redelivery, or dead-letters it if this was
    /// its last allowed delivery.
    fn nack(
        &self,
        lease: &Lease,
        reason: &str,
    ) -> impl Future<Output = Result<NackOutcome>> + Send;

    fn stats(&self) -> impl Future<Output = Result<QueueStats>> + Send;
}
