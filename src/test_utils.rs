//! Shared test fixtures and fakes with failure injection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::dead_letter::{
    self, DeadLetterEntry, DeadLetterError, DeadLetterSink, MemoryDeadLetterSink, RejectedCommit,
};
use crate::ledger::{
    self, ClaimOutcome, CommitTransition, IdempotencyLedger, LedgerEntry, LedgerError,
    LocalLedger,
};
use crate::queue::{
    self, Delivery, Lease, LocalWorkQueue, NackOutcome, NewWorkItem, QueueError, QueueStats,
    WorkItem, WorkQueue,
};
use crate::store::{CommitError, CommitReceipt, RecordStore};
use crate::types::{
    ClaimId, MatchRequest, MessageId, RequestKey, StoreRecords, TableName,
};

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn table() -> TableName {
    TableName::parse("Matches").unwrap()
}

pub fn match_request(learner: &str, tutor: &str) -> MatchRequest {
    MatchRequest::from_value(json!({
        "Learner": learner,
        "Tutor": tutor,
        "Approval Status": "Requested",
        "Learner Available Time Slots": ["slotA", "slotB"],
        "Tutor Available Time Slots": ["slotB", "slotC"],
    }))
    .unwrap()
}

pub fn request_body(learner: &str, tutor: &str) -> Vec<u8> {
    serde_json::to_vec(&match_request(learner, tutor)).unwrap()
}

pub fn new_work_item(learner: &str, tutor: &str) -> NewWorkItem {
    NewWorkItem {
        key: RequestKey::for_pair(learner, tutor),
        claim_id: ClaimId::generate(),
        table: table(),
        payload: match_request(learner, tutor),
    }
}

pub fn work_item(learner: &str, tutor: &str) -> WorkItem {
    let new = new_work_item(learner, tutor);
    WorkItem {
        message_id: MessageId::generate(),
        key: new.key,
        claim_id: new.claim_id,
        table: new.table,
        payload: new.payload,
        enqueued_at: t0(),
        delivery_count: 1,
    }
}

// ─── Dead-letter sink ─────────────────────────────────────────────────────────

/// Memory sink whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct FailingDeadLetterSink {
    inner: MemoryDeadLetterSink,
    failing: AtomicBool,
}

impl FailingDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> dead_letter::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Io(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

impl DeadLetterSink for FailingDeadLetterSink {
    fn quarantine(&self, entry: &DeadLetterEntry) -> dead_letter::Result<()> {
        self.check()?;
        self.inner.quarantine(entry)
    }

    fn list(&self) -> dead_letter::Result<Vec<DeadLetterEntry>> {
        self.inner.list()
    }

    fn get(&self, message_id: &MessageId) -> dead_letter::Result<Option<DeadLetterEntry>> {
        self.inner.get(message_id)
    }

    fn remove(&self, message_id: &MessageId) -> dead_letter::Result<bool> {
        self.check()?;
        self.inner.remove(message_id)
    }

    fn record_rejection(&self, rejection: &RejectedCommit) -> dead_letter::Result<()> {
        self.check()?;
        self.inner.record_rejection(rejection)
    }

    fn rejections(&self) -> dead_letter::Result<Vec<RejectedCommit>> {
        self.inner.rejections()
    }
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

/// A [`LocalLedger`] with injectable failures and latency.
#[derive(Debug, Default)]
pub struct FlakyLedger {
    pub inner: LocalLedger,
    fail_claims: AtomicBool,
    fail_gets: AtomicBool,
    fail_releases: AtomicBool,
    /// Number of upcoming `mark_committed` calls that fail.
    commit_failures: AtomicU32,
    claim_delay: Mutex<Option<Duration>>,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, n: u32) {
        self.commit_failures.store(n, Ordering::SeqCst);
    }

    pub fn delay_claims(&self, delay: Duration) {
        *self.claim_delay.lock().unwrap() = Some(delay);
    }

    fn unavailable() -> LedgerError {
        LedgerError::Unavailable("injected failure".to_string())
    }
}

impl IdempotencyLedger for FlakyLedger {
    async fn try_claim(
        &self,
        entry: LedgerEntry,
        now: DateTime<Utc>,
    ) -> ledger::Result<ClaimOutcome> {
        let delay = *self.claim_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.try_claim(entry, now).await
    }

    async fn get(&self, key: &RequestKey) -> ledger::Result<Option<LedgerEntry>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.get(key).await
    }

    async fn mark_committed(
        &self,
        key: &RequestKey,
        claim_id: &ClaimId,
        now: DateTime<Utc>,
    ) -> ledger::Result<CommitTransition> {
        let remaining = self.commit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.commit_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Self::unavailable());
        }
        self.inner.mark_committed(key, claim_id, now).await
    }

    async fn release(&self, key: &RequestKey, claim_id: &ClaimId) -> ledger::Result<bool> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.release(key, claim_id).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> ledger::Result<usize> {
        self.inner.purge_expired(now).await
    }
}

// ─── Queue ────────────────────────────────────────────────────────────────────

/// A [`LocalWorkQueue`] whose enqueues can be made to fail.
#[derive(Debug)]
pub struct FlakyQueue {
    pub inner: LocalWorkQueue,
    fail_enqueues: AtomicBool,
}

impl FlakyQueue {
    pub fn new(inner: LocalWorkQueue) -> Self {
        Self {
            inner,
            fail_enqueues: AtomicBool::new(false),
        }
    }

    pub fn fail_enqueues(&self, fail: bool) {
        self.fail_enqueues.store(fail, Ordering::SeqCst);
    }
}

impl WorkQueue for FlakyQueue {
    async fn enqueue(&self, item: NewWorkItem, delay: Duration) -> queue::Result<MessageId> {
        if self.fail_enqueues.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("injected failure".to_string()));
        }
        self.inner.enqueue(item, delay).await
    }

    async fn receive(&self) -> queue::Result<Option<Delivery>> {
        self.inner.receive().await
    }

    async fn ack(&self, lease: &Lease) -> queue::Result<()> {
        self.inner.ack(lease).await
    }

    async fn nack(&self, lease: &Lease, reason: &str) -> queue::Result<NackOutcome> {
        self.inner.nack(lease, reason).await
    }

    async fn stats(&self) -> queue::Result<QueueStats> {
        self.inner.stats().await
    }
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// One scripted response from [`ScriptedStore`].
#[derive(Debug, Clone)]
pub enum StoreReply {
    Ok,
    Transient(&'static str),
    Permanent(u16, &'static str),
    /// Never answers; exercises timeouts and cancellation.
    Hang,
    /// Accepts the record after the given delay.
    Slow(Duration),
}

/// A record store that replays a script, then succeeds.
#[derive(Debug, Default)]
pub struct ScriptedStore {
    script: Mutex<VecDeque<StoreReply>>,
    commits: Mutex<Vec<(TableName, StoreRecords)>>,
    calls: AtomicU32,
}

impl ScriptedStore {
    pub fn new(script: impl IntoIterator<Item = StoreReply>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Number of `commit_record` calls, successful or not.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Records from successful commits.
    pub fn commits(&self) -> Vec<(TableName, StoreRecords)> {
        self.commits.lock().unwrap().clone()
    }
}

impl RecordStore for ScriptedStore {
    async fn commit_record(
        &self,
        table: &TableName,
        records: &StoreRecords,
    ) -> Result<CommitReceipt, CommitError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StoreReply::Ok);

        if let StoreReply::Slow(delay) = reply {
            tokio::time::sleep(delay).await;
        }

        match reply {
            StoreReply::Ok | StoreReply::Slow(_) => {
                self.commits
                    .lock()
                    .unwrap()
                    .push((table.clone(), records.clone()));
                Ok(CommitReceipt {
                    record_ids: vec![format!("rec{call:05}")],
                })
            }
            StoreReply::Transient(msg) => Err(CommitError::transient(msg)),
            StoreReply::Permanent(code, msg) => Err(CommitError::from_status(
                reqwest::StatusCode::from_u16(code).unwrap(),
                msg,
            )),
            StoreReply::Hang => std::future::pending().await,
        }
    }
}
