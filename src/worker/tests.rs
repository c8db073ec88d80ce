//! End-to-end scenarios for the verifier, queue and workers together.
//!
//! Time is driven by a [`ManualClock`]: initial delays, lease windows and
//! claim expiry only pass when a test advances it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::ManualClock;
use crate::dead_letter::{DeadLetterSink, MemoryDeadLetterSink, RejectionReason};
use crate::ledger::{ClaimState, IdempotencyLedger, LedgerEntry};
use crate::queue::{LocalWorkQueue, NackOutcome, QueueConfig, WorkQueue};
use crate::retry::RetryConfig;
use crate::test_utils::{
    FlakyLedger, ScriptedStore, StoreReply, request_body, t0, table, work_item,
};
use crate::types::{RequestKey, StoreRecords};
use crate::verifier::{Verdict, Verifier, VerifierConfig};

use super::{
    DuplicateReason, Fulfiller, FulfillerConfig, Fulfillment, PollConfig, RunOutcome, Worker,
    spawn_workers, sweep_once,
};

// ─── Test Helpers ───

const INITIAL_DELAY: Duration = Duration::from_secs(5);
const LEASE_WINDOW: Duration = Duration::from_secs(30);
const CLAIM_TTL: Duration = Duration::from_secs(3600);
const MAX_DELIVERIES: u32 = 4;

struct Harness {
    clock: Arc<ManualClock>,
    ledger: Arc<FlakyLedger>,
    sink: Arc<MemoryDeadLetterSink>,
    queue: Arc<LocalWorkQueue>,
    store: Arc<ScriptedStore>,
    verifier: Verifier<FlakyLedger, LocalWorkQueue>,
    fulfiller: Arc<Fulfiller<FlakyLedger, ScriptedStore>>,
}

impl Harness {
    fn new(script: impl IntoIterator<Item = StoreReply>) -> Self {
        Self::with_store_timeout(script, Duration::from_secs(10))
    }

    fn with_store_timeout(
        script: impl IntoIterator<Item = StoreReply>,
        store_timeout: Duration,
    ) -> Self {
        Self::with_fulfiller_config(
            script,
            FulfillerConfig {
                store_timeout,
                dependency_timeout: Duration::from_secs(2),
                finalize_retry: RetryConfig::IMMEDIATE,
            },
        )
    }

    fn with_fulfiller_config(
        script: impl IntoIterator<Item = StoreReply>,
        fulfiller_config: FulfillerConfig,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let ledger = Arc::new(FlakyLedger::new());
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let queue = Arc::new(LocalWorkQueue::new(
            QueueConfig {
                lease_window: LEASE_WINDOW,
                max_deliveries: MAX_DELIVERIES,
                capacity: None,
            },
            clock.clone(),
            sink.clone(),
        ));
        let store = Arc::new(ScriptedStore::new(script));
        let verifier = Verifier::new(
            ledger.clone(),
            queue.clone(),
            clock.clone(),
            VerifierConfig {
                claim_ttl: CLAIM_TTL,
                initial_delay: INITIAL_DELAY,
                dependency_timeout: Duration::from_secs(2),
            },
        );
        let fulfiller = Arc::new(Fulfiller::new(
            ledger.clone(),
            store.clone(),
            sink.clone(),
            clock.clone(),
            fulfiller_config,
        ));

        Self {
            clock,
            ledger,
            sink,
            queue,
            store,
            verifier,
            fulfiller,
        }
    }

    fn worker(&self, id: usize) -> Worker<FlakyLedger, LocalWorkQueue, ScriptedStore> {
        Worker::new(
            id,
            self.queue.clone(),
            self.fulfiller.clone(),
            PollConfig::new(Duration::from_millis(5)),
            Duration::from_secs(2),
        )
    }

    async fn submit(&self, learner: &str, tutor: &str) -> Verdict {
        self.verifier
            .submit(&table(), &request_body(learner, tutor))
            .await
            .unwrap()
    }

    async fn state_of(&self, learner: &str, tutor: &str) -> Option<LedgerEntry> {
        self.ledger
            .get(&RequestKey::for_pair(learner, tutor))
            .await
            .unwrap()
    }
}

// ─── Lifecycle ───

#[tokio::test]
async fn full_lifecycle_accept_duplicate_commit_expire() {
    let h = Harness::new([]);
    let worker = h.worker(0);
    let token = CancellationToken::new();

    assert!(matches!(h.submit("L1", "T1").await, Verdict::Accepted { .. }));
    assert_eq!(
        h.submit("L1", "T1").await,
        Verdict::Duplicate {
            key: RequestKey::for_pair("L1", "T1"),
            state: ClaimState::Claimed
        }
    );

    // Not visible before the initial delay.
    assert_eq!(worker.run_once(&token).await.unwrap(), RunOutcome::Idle);
    h.clock.advance(INITIAL_DELAY);
    assert_eq!(
        worker.run_once(&token).await.unwrap(),
        RunOutcome::Acked(Fulfillment::Committed {
            ledger_finalized: true
        })
    );

    let entry = h.state_of("L1", "T1").await.unwrap();
    assert_eq!(entry.state, ClaimState::Committed);
    assert_eq!(h.store.commits().len(), 1);

    // Still a duplicate while the entry lives.
    h.clock.advance(CLAIM_TTL - INITIAL_DELAY - Duration::from_secs(1));
    assert_eq!(
        h.submit("L1", "T1").await,
        Verdict::Duplicate {
            key: RequestKey::for_pair("L1", "T1"),
            state: ClaimState::Committed
        }
    );

    // Accepted again once it has expired.
    h.clock.advance(Duration::from_secs(1));
    assert!(matches!(h.submit("L1", "T1").await, Verdict::Accepted { .. }));
}

#[tokio::test]
async fn committed_record_has_store_shape() {
    let h = Harness::new([]);
    h.submit("recLearner", "recTutor").await;
    h.clock.advance(INITIAL_DELAY);
    h.worker(0)
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    let commits = h.store.commits();
    let (committed_table, records) = &commits[0];
    assert_eq!(committed_table, &table());
    let fields = &records.records[0].fields;
    assert_eq!(fields.learner, vec!["recLearner"]);
    assert_eq!(fields.tutor, vec!["recTutor"]);
    assert_eq!(fields.overlapping_time_slots, vec!["slotB"]);
}

// ─── Redelivery ───

#[tokio::test]
async fn three_timeouts_then_success_commits_without_dead_letter() {
    let h = Harness::new([
        StoreReply::Transient("timed out"),
        StoreReply::Transient("timed out"),
        StoreReply::Transient("timed out"),
        StoreReply::Ok,
    ]);
    let worker = h.worker(0);
    let token = CancellationToken::new();

    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);

    for attempt in 1..=3 {
        let outcome = worker.run_once(&token).await.unwrap();
        assert!(
            matches!(
                outcome,
                RunOutcome::Nacked {
                    outcome: NackOutcome::Redeliver { .. },
                    ..
                }
            ),
            "attempt {attempt}: {outcome:?}"
        );
        // Invisible until the lease window has passed.
        assert_eq!(worker.run_once(&token).await.unwrap(), RunOutcome::Idle);
        h.clock.advance(LEASE_WINDOW);
    }

    assert_eq!(
        worker.run_once(&token).await.unwrap(),
        RunOutcome::Acked(Fulfillment::Committed {
            ledger_finalized: true
        })
    );
    assert_eq!(h.store.calls(), 4);
    assert_eq!(h.store.commits().len(), 1);
    assert!(h.sink.list().unwrap().is_empty());
    assert_eq!(h.queue.stats().await.unwrap().total(), 0);
    assert_eq!(
        h.state_of("L1", "T1").await.unwrap().state,
        ClaimState::Committed
    );
}

#[tokio::test]
async fn four_transient_failures_dead_letter() {
    let h = Harness::new([
        StoreReply::Transient("503"),
        StoreReply::Transient("503"),
        StoreReply::Transient("503"),
        StoreReply::Transient("503 final"),
    ]);
    let worker = h.worker(0);
    let token = CancellationToken::new();

    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);

    for _ in 1..MAX_DELIVERIES {
        worker.run_once(&token).await.unwrap();
        h.clock.advance(LEASE_WINDOW);
    }
    let last = worker.run_once(&token).await.unwrap();
    assert!(matches!(
        last,
        RunOutcome::Nacked {
            outcome: NackOutcome::DeadLettered,
            ..
        }
    ));

    let dead = h.sink.list().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].delivery_count, 4);
    assert!(dead[0].last_error.contains("503 final"));
    assert_eq!(dead[0].item.key, RequestKey::for_pair("L1", "T1"));

    // Never delivered again.
    h.clock.advance(LEASE_WINDOW);
    assert_eq!(worker.run_once(&token).await.unwrap(), RunOutcome::Idle);
    assert_eq!(h.store.calls(), 4);
    assert!(h.store.commits().is_empty());
}

#[tokio::test]
async fn dead_letter_replay_commits_once() {
    let h = Harness::new(std::iter::repeat_n(StoreReply::Transient("down"), 4));
    let worker = h.worker(0);
    let token = CancellationToken::new();

    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);
    for _ in 0..MAX_DELIVERIES {
        worker.run_once(&token).await.unwrap();
        h.clock.advance(LEASE_WINDOW);
    }
    let dead = h.sink.list().unwrap();
    assert_eq!(dead.len(), 1);

    let verdict = h
        .verifier
        .replay(h.sink.as_ref(), &dead[0].item.message_id)
        .await
        .unwrap();
    assert!(matches!(verdict, Verdict::Accepted { .. }));
    assert!(h.sink.list().unwrap().is_empty());

    h.clock.advance(INITIAL_DELAY);
    assert_eq!(
        worker.run_once(&token).await.unwrap(),
        RunOutcome::Acked(Fulfillment::Committed {
            ledger_finalized: true
        })
    );
    assert_eq!(h.store.commits().len(), 1);
}

// ─── Duplicate deliveries ───

#[tokio::test]
async fn duplicate_delivery_after_commit_skips_store() {
    let h = Harness::new([]);
    let Verdict::Accepted { message_id, .. } = h.submit("L1", "T1").await else {
        panic!("expected Accepted");
    };
    h.clock.advance(INITIAL_DELAY);
    let delivery = h.queue.receive().await.unwrap().unwrap();
    assert_eq!(delivery.item.message_id, message_id);

    assert_eq!(
        h.fulfiller.process(&delivery.item).await,
        Fulfillment::Committed {
            ledger_finalized: true
        }
    );
    // The same item again, as if the ack had been lost.
    assert_eq!(
        h.fulfiller.process(&delivery.item).await,
        Fulfillment::Duplicate(DuplicateReason::AlreadyCommitted)
    );
    assert_eq!(h.store.calls(), 1);
}

#[tokio::test]
async fn lapsed_lease_after_commit_is_acked_without_second_commit() {
    let h = Harness::new([]);
    let worker = h.worker(0);
    let token = CancellationToken::new();

    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);

    // First consumer commits but dies before acking.
    let abandoned = h.queue.receive().await.unwrap().unwrap();
    h.fulfiller.process(&abandoned.item).await;

    h.clock.advance(LEASE_WINDOW);
    assert_eq!(
        worker.run_once(&token).await.unwrap(),
        RunOutcome::Acked(Fulfillment::Duplicate(DuplicateReason::AlreadyCommitted))
    );
    assert_eq!(h.store.calls(), 1);
}

#[tokio::test]
async fn missing_entry_is_duplicate() {
    let h = Harness::new([]);
    let item = work_item("L1", "T1");
    assert_eq!(
        h.fulfiller.process(&item).await,
        Fulfillment::Duplicate(DuplicateReason::Missing)
    );
    assert_eq!(h.store.calls(), 0);
}

#[tokio::test]
async fn expired_claim_is_treated_as_absent() {
    let h = Harness::new([]);
    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);
    let delivery = h.queue.receive().await.unwrap().unwrap();

    h.clock.advance(CLAIM_TTL);
    assert_eq!(
        h.fulfiller.process(&delivery.item).await,
        Fulfillment::Duplicate(DuplicateReason::Expired)
    );
    assert_eq!(h.store.calls(), 0);
}

#[tokio::test]
async fn stale_item_after_reclaim_is_superseded() {
    let h = Harness::new([]);
    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);
    let stale = h.queue.receive().await.unwrap().unwrap();

    // The claim expires and the key is claimed again.
    h.clock.advance(CLAIM_TTL);
    assert!(matches!(h.submit("L1", "T1").await, Verdict::Accepted { .. }));

    assert_eq!(
        h.fulfiller.process(&stale.item).await,
        Fulfillment::Duplicate(DuplicateReason::Superseded)
    );
    assert_eq!(h.store.calls(), 0);
}

// ─── Failures ───

#[tokio::test]
async fn permanent_failure_is_acked_and_recorded() {
    let h = Harness::new([StoreReply::Permanent(422, "Unknown field name")]);
    let worker = h.worker(0);

    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);
    let outcome = worker.run_once(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Acked(Fulfillment::Fatal(_))));

    let rejections = h.sink.rejections().unwrap();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].reason, RejectionReason::PermanentCommitError);
    assert_eq!(rejections[0].status_code, Some(422));
    assert!(h.sink.list().unwrap().is_empty());

    // The entry is left to expire.
    assert_eq!(
        h.state_of("L1", "T1").await.unwrap().state,
        ClaimState::Claimed
    );
    assert!(matches!(h.submit("L1", "T1").await, Verdict::Duplicate { .. }));
}

#[tokio::test]
async fn ledger_read_failure_is_retried_by_redelivery() {
    let h = Harness::new([]);
    let worker = h.worker(0);
    let token = CancellationToken::new();

    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);
    h.ledger.fail_gets(true);
    assert!(matches!(
        worker.run_once(&token).await.unwrap(),
        RunOutcome::Nacked {
            outcome: NackOutcome::Redeliver { .. },
            ..
        }
    ));
    assert_eq!(h.store.calls(), 0);

    h.ledger.fail_gets(false);
    h.clock.advance(LEASE_WINDOW);
    assert!(matches!(
        worker.run_once(&token).await.unwrap(),
        RunOutcome::Acked(Fulfillment::Committed { .. })
    ));
}

#[tokio::test]
async fn ledger_finalization_recovers_within_retries() {
    let h = Harness::new([]);
    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);
    h.ledger.fail_next_commits(2);

    let outcome = h.worker(0).run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Acked(Fulfillment::Committed {
            ledger_finalized: true
        })
    );
    assert!(h.sink.rejections().unwrap().is_empty());
}

#[tokio::test]
async fn partial_success_is_acked_and_recorded() {
    let h = Harness::new([]);
    let worker = h.worker(0);
    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);
    h.ledger.fail_next_commits(100);

    let outcome = worker.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Acked(Fulfillment::Committed {
            ledger_finalized: false
        })
    );
    assert_eq!(h.store.calls(), 1);
    assert_eq!(h.queue.stats().await.unwrap().total(), 0);

    let rejections = h.sink.rejections().unwrap();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].reason, RejectionReason::LedgerNotFinalized);

    // The claim still blocks resubmission until it expires.
    assert!(matches!(
        h.submit("L1", "T1").await,
        Verdict::Duplicate {
            state: ClaimState::Claimed,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn store_timeout_is_transient() {
    let h = Harness::with_store_timeout([StoreReply::Hang], Duration::from_secs(10));
    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);

    let outcome = h.worker(0).run_once(&CancellationToken::new()).await.unwrap();
    let RunOutcome::Nacked { reason, outcome } = outcome else {
        panic!("expected Nacked, got {outcome:?}");
    };
    assert!(reason.contains("timed out"));
    assert!(matches!(outcome, NackOutcome::Redeliver { .. }));
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_processing_and_returns_item() {
    let h = Harness::with_store_timeout([StoreReply::Hang], Duration::from_secs(600));
    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let outcome = h.worker(0).run_once(&token).await.unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Interrupted(NackOutcome::Redeliver { .. })
    ));
    assert!(h.store.commits().is_empty());

    // A later worker picks it up after the lease window.
    h.clock.advance(LEASE_WINDOW);
    let next = h.queue.receive().await.unwrap().unwrap();
    assert_eq!(next.item.delivery_count, 2);
}

fn cancel_after(token: &CancellationToken, delay: Duration) {
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        canceller.cancel();
    });
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_store_call_waits_for_commit() {
    let h = Harness::with_store_timeout(
        [StoreReply::Slow(Duration::from_secs(2))],
        Duration::from_secs(10),
    );
    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);

    let token = CancellationToken::new();
    cancel_after(&token, Duration::from_millis(50));

    let outcome = h.worker(0).run_once(&token).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Acked(Fulfillment::Committed {
            ledger_finalized: true
        })
    );
    assert_eq!(h.store.commits().len(), 1);
    assert_eq!(
        h.state_of("L1", "T1").await.unwrap().state,
        ClaimState::Committed
    );
    assert_eq!(h.queue.stats().await.unwrap().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_finalize_backoff_acks_without_second_commit() {
    let h = Harness::with_fulfiller_config(
        [],
        FulfillerConfig {
            store_timeout: Duration::from_secs(10),
            dependency_timeout: Duration::from_secs(2),
            finalize_retry: RetryConfig::DEFAULT,
        },
    );
    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);
    h.ledger.fail_next_commits(100);

    // The first finalize attempt fails at once; cancellation lands in the
    // backoff sleep that follows.
    let token = CancellationToken::new();
    cancel_after(&token, Duration::from_millis(50));

    let outcome = h.worker(0).run_once(&token).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Acked(Fulfillment::Committed {
            ledger_finalized: false
        })
    );
    assert_eq!(h.store.calls(), 1);

    let rejections = h.sink.rejections().unwrap();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].reason, RejectionReason::LedgerNotFinalized);

    // Nothing is left for a later worker to write again.
    h.clock.advance(LEASE_WINDOW);
    let later = h.worker(1).run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(later, RunOutcome::Idle);
    assert_eq!(h.store.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_commit_within_lease_is_not_redelivered() {
    let h = Harness::with_store_timeout(
        [StoreReply::Slow(Duration::from_secs(20))],
        Duration::from_secs(25),
    );
    h.submit("L1", "T1").await;
    h.clock.advance(INITIAL_DELAY);

    let first = h.worker(0);
    let in_flight = tokio::spawn(async move { first.run_once(&CancellationToken::new()).await });

    // Almost a full lease passes while the store call is still running.
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.clock.advance(LEASE_WINDOW - Duration::from_secs(1));
    let second = h.worker(1).run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(second, RunOutcome::Idle);
    assert_eq!(h.store.calls(), 1);

    let outcome = in_flight.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Acked(Fulfillment::Committed {
            ledger_finalized: true
        })
    );

    h.clock.advance(LEASE_WINDOW);
    let later = h.worker(1).run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(later, RunOutcome::Idle);
    assert_eq!(h.store.commits().len(), 1);
}

// ─── Concurrency ───

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_commit_each_key_once() {
    let h = Harness::new([]);
    let pairs: Vec<(String, String)> = (0..10)
        .map(|i| (format!("L{i}"), format!("T{i}")))
        .collect();

    // Every pair submitted three times.
    for _ in 0..3 {
        for (learner, tutor) in &pairs {
            h.submit(learner, tutor).await;
        }
    }
    h.clock.advance(INITIAL_DELAY);

    let shutdown = CancellationToken::new();
    let handles = spawn_workers(
        4,
        h.queue.clone(),
        h.fulfiller.clone(),
        PollConfig::new(Duration::from_millis(5)),
        Duration::from_secs(2),
        shutdown.clone(),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.queue.stats().await.unwrap().total() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "workers did not drain the queue");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    let mut per_learner: HashMap<String, usize> = HashMap::new();
    for (_, StoreRecords { records }) in h.store.commits() {
        *per_learner
            .entry(records[0].fields.learner[0].clone())
            .or_default() += 1;
    }
    assert_eq!(per_learner.len(), pairs.len());
    assert!(per_learner.values().all(|&n| n == 1));
}

// ─── Sweeper ───

#[tokio::test]
async fn sweeper_purges_expired_entries() {
    let h = Harness::new([]);
    h.submit("L1", "T1").await;
    h.clock.advance(Duration::from_secs(60));
    h.submit("L2", "T2").await;

    assert_eq!(sweep_once(h.ledger.as_ref(), h.clock.as_ref()).await.unwrap(), 0);

    h.clock.advance(CLAIM_TTL - Duration::from_secs(60));
    assert_eq!(sweep_once(h.ledger.as_ref(), h.clock.as_ref()).await.unwrap(), 1);
    assert!(h.state_of("L1", "T1").await.is_none());
    assert!(h.state_of("L2", "T2").await.is_some());
}
