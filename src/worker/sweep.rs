//! Periodic removal of expired ledger entries.
//!
//! Expired entries are already treated as absent by every ledger operation,
//! so the sweeper only bounds the ledger's size.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::ledger::{self, IdempotencyLedger};

/// Purges expired entries once. Returns the number removed.
pub async fn sweep_once<L: IdempotencyLedger>(
    ledger: &L,
    clock: &dyn Clock,
) -> ledger::Result<usize> {
    let purged = ledger.purge_expired(clock.now()).await?;
    if purged > 0 {
        info!(purged, "Purged expired ledger entries");
    } else {
        debug!("No expired ledger entries");
    }
    Ok(purged)
}

/// Runs [`sweep_once`] every `interval` until `shutdown` is cancelled.
#[instrument(skip_all, fields(interval = ?interval))]
pub async fn run_ledger_sweeper<L: IdempotencyLedger>(
    ledger: Arc<L>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sweep_once(ledger.as_ref(), clock.as_ref()).await {
                    warn!(error = %e, "Ledger sweep failed");
                }
            }
        }
    }

    debug!("Ledger sweeper stopped");
}
