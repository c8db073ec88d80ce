//! In-process work queue.
//!
//! Items are kept in one mutex-guarded map keyed by message ID. Message IDs
//! are ULIDs, so iteration order is enqueue order. Time comes from an injected
//! [`Clock`], which lets tests step through delays and lease windows.
//!
//! # Slot states
//!
//! ```text
//!              enqueue(delay)
//!                   |
//!                   v
//!   +--------> [waiting] --(visible_at reached)--> [ready]
//!   |                                                 |
//!   |  nack / lease lapsed                         receive
//!   |  (deliveries left)                              |
//!   +--------------------------------------------[leased]
//!                                                 |      |
//!                                               ack    nack / lease lapsed
//!                                                 |    (last delivery)
//!                                              removed      |
//!                                                     dead-letter sink
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    Delivery, Lease, NackOutcome, NewWorkItem, QueueError, QueueStats, Result, WorkItem,
    WorkQueue,
};
use crate::clock::{Clock, delta};
use crate::dead_letter::{DeadLetterEntry, DeadLetterSink};
use crate::persistence::{save_snapshot, try_load_snapshot};
use crate::types::{LeaseToken, MessageId};

/// Reason recorded when the last delivery's lease ran out.
pub const LEASE_EXPIRED: &str = "lease expired without acknowledgement";

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// How long a received item stays invisible to other consumers.
    pub lease_window: Duration,

    /// Deliveries allowed before an item is dead-lettered.
    pub max_deliveries: u32,

    /// Maximum number of items held, if bounded.
    pub capacity: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_window: Duration::from_secs(60),
            max_deliveries: 4,
            capacity: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    item: WorkItem,
    visible_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease: Option<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl Slot {
    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_none() && self.visible_at <= now
    }

    fn holds(&self, lease: &Lease) -> bool {
        self.lease.as_ref().is_some_and(|held| held.token == lease.token)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    slots: BTreeMap<MessageId, Slot>,
}

#[derive(Debug)]
pub struct LocalWorkQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    dead_letters: Arc<dyn DeadLetterSink>,
    snapshot_path: Option<PathBuf>,
}

impl LocalWorkQueue {
    /// A queue that keeps state in memory only.
    pub fn new(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            config,
            clock,
            dead_letters,
            snapshot_path: None,
        }
    }

    /// Opens a queue backed by the snapshot at `path`, loading it if present.
    pub fn open(
        path: impl Into<PathBuf>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Result<Self> {
        let path = path.into();
        let state: QueueState = try_load_snapshot(&path)?.unwrap_or_default();
        info!(path = %path.display(), items = state.slots.len(), "Opened work queue");
        Ok(Self {
            state: Mutex::new(state),
            config,
            clock,
            dead_letters,
            snapshot_path: Some(path),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Copy of the state to restore if the snapshot write fails.
    fn backup(&self, state: &QueueState) -> Option<QueueState> {
        self.snapshot_path.as_ref().map(|_| state.clone())
    }

    async fn persist(&self, state: &mut QueueState, backup: Option<QueueState>) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if let Err(e) = save_snapshot(path, &*state).await {
            if let Some(backup) = backup {
                *state = backup;
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Moves a slot to the dead-letter sink, removing it from the queue.
    ///
    /// If the sink write fails the slot stays where it is.
    fn dead_letter(
        &self,
        state: &mut QueueState,
        message_id: &MessageId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(slot) = state.slots.get(message_id) else {
            return Ok(());
        };

        let entry = DeadLetterEntry {
            item: slot.item.clone(),
            delivery_count: slot.item.delivery_count,
            last_error: slot
                .last_error
                .clone()
                .unwrap_or_else(|| LEASE_EXPIRED.to_string()),
            dead_lettered_at: now,
        };
        self.dead_letters.quarantine(&entry)?;
        state.slots.remove(message_id);

        info!(
            message_id = %message_id,
            key = %entry.item.key,
            delivery_count = entry.delivery_count,
            last_error = %entry.last_error,
            "Dead-lettered work item"
        );
        Ok(())
    }

    /// Returns items whose lease lapsed to the queue, or dead-letters them if
    /// they have no deliveries left. Returns whether anything changed.
    fn sweep(&self, state: &mut QueueState, now: DateTime<Utc>) -> bool {
        let lapsed: Vec<MessageId> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.lease.as_ref().is_some_and(|l| l.expires_at <= now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut changed = false;
        for message_id in lapsed {
            let Some(slot) = state.slots.get_mut(&message_id) else {
                continue;
            };

            if slot.item.delivery_count < self.config.max_deliveries {
                if let Some(lease) = slot.lease.take() {
                    slot.visible_at = lease.expires_at;
                }
                if slot.last_error.is_none() {
                    slot.last_error = Some(LEASE_EXPIRED.to_string());
                }
                debug!(%message_id, "Lease lapsed, item visible again");
                changed = true;
                continue;
            }

            match self.dead_letter(state, &message_id, now) {
                Ok(()) => changed = true,
                Err(e) => warn!(
                    %message_id,
                    error = %e,
                    "Failed to dead-letter item, will retry on next sweep"
                ),
            }
        }
        changed
    }

    fn count(&self, state: &QueueState, now: DateTime<Utc>) -> QueueStats {
        let mut stats = QueueStats::default();
        for slot in state.slots.values() {
            if slot.lease.is_some() {
                stats.in_flight += 1;
            } else if slot.visible_at <= now {
                stats.ready += 1;
            } else {
                stats.delayed += 1;
            }
        }
        stats
    }
}

impl WorkQueue for LocalWorkQueue {
    async fn enqueue(&self, item: NewWorkItem, delay: Duration) -> Result<MessageId> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if let Some(capacity) = self.config.capacity
            && state.slots.len() >= capacity
        {
            return Err(QueueError::Full { capacity });
        }

        let backup = self.backup(&state);
        let message_id = MessageId::generate();
        let visible_at = now.checked_add_signed(delta(delay)).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let slot = Slot {
            item: WorkItem {
                message_id: message_id.clone(),
                key: item.key,
                claim_id: item.claim_id,
                table: item.table,
                payload: item.payload,
                enqueued_at: now,
                delivery_count: 0,
            },
            visible_at,
            lease: None,
            last_error: None,
        };
        let key = slot.item.key.clone();
        state.slots.insert(message_id.clone(), slot);
        self.persist(&mut state, backup).await?;

        debug!(%message_id, %key, %visible_at, "Enqueued work item");
        Ok(message_id)
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let backup = self.backup(&state);

        let swept = self.sweep(&mut state, now);

        let next = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_ready(now))
            .min_by_key(|(id, slot)| (slot.visible_at, (*id).clone()))
            .map(|(id, _)| id.clone());

        let Some(message_id) = next else {
            if swept {
                self.persist(&mut state, backup).await?;
            }
            return Ok(None);
        };

        let lease = Lease {
            message_id: message_id.clone(),
            token: LeaseToken::generate(),
            expires_at: now
                .checked_add_signed(delta(self.config.lease_window))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let Some(slot) = state.slots.get_mut(&message_id) else {
            return Ok(None);
        };
        slot.item.delivery_count += 1;
        slot.lease = Some(lease.clone());
        let item = slot.item.clone();

        self.persist(&mut state, backup).await?;

        debug!(
            %message_id,
            key = %item.key,
            delivery_count = item.delivery_count,
            "Leased work item"
        );
        Ok(Some(Delivery { item, lease }))
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        let mut state = self.state.lock().await;

        let held = state
            .slots
            .get(&lease.message_id)
            .is_some_and(|slot| slot.holds(lease));
        if !held {
            return Err(QueueError::LeaseLost(lease.message_id.clone()));
        }

        let backup = self.backup(&state);
        state.slots.remove(&lease.message_id);
        self.persist(&mut state, backup).await?;

        debug!(message_id = %lease.message_id, "Acknowledged work item");
        Ok(())
    }

    async fn nack(&self, lease: &Lease, reason: &str) -> Result<NackOutcome> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let backup = self.backup(&state);

        let Some(slot) = state
            .slots
            .get_mut(&lease.message_id)
            .filter(|slot| slot.holds(lease))
        else {
            return Err(QueueError::LeaseLost(lease.message_id.clone()));
        };
        slot.last_error = Some(reason.to_string());

        if slot.item.delivery_count >= self.config.max_deliveries {
            if let Err(e) = self.dead_letter(&mut state, &lease.message_id, now) {
                // Leave the slot leased but lapsed so the next sweep retries.
                if let Some(slot) = state.slots.get_mut(&lease.message_id)
                    && let Some(held) = slot.lease.as_mut()
                {
                    held.expires_at = now;
                }
                if let Err(persist_err) = self.persist(&mut state, None).await {
                    error!(
                        message_id = %lease.message_id,
                        error = %persist_err,
                        "Failed to persist queue after failed dead-letter"
                    );
                }
                return Err(e);
            }
            self.persist(&mut state, backup).await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let visible_at = lease.expires_at;
        slot.lease = None;
        slot.visible_at = visible_at;
        let delivery_count = slot.item.delivery_count;
        self.persist(&mut state, backup).await?;

        debug!(
            message_id = %lease.message_id,
            delivery_count,
            %visible_at,
            reason,
            "Returned work item for redelivery"
        );
        Ok(NackOutcome::Redeliver { visible_at })
    }

    async fn stats(&self) -> Result<QueueStats> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let backup = self.backup(&state);

        if self.sweep(&mut state, now) {
            self.persist(&mut state, backup).await?;
        }
        Ok(self.count(&state, now))
    }
}
