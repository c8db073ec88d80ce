//! In-process ledger.
//!
//! All entries live in one mutex-guarded map, which makes every conditional
//! write atomic. With a snapshot path configured, the map is rewritten after
//! each mutation; if that write fails the in-memory change is undone so memory
//! never runs ahead of disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    ClaimOutcome, ClaimState, CommitTransition, IdempotencyLedger, LedgerEntry, Result,
};
use crate::persistence::{save_snapshot, try_load_snapshot};
use crate::types::{ClaimId, RequestKey};

type Entries = BTreeMap<RequestKey, LedgerEntry>;

#[derive(Debug, Default)]
pub struct LocalLedger {
    entries: Mutex<Entries>,
    snapshot_path: Option<PathBuf>,
}

impl LocalLedger {
    /// A ledger that keeps state in memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a ledger backed by the snapshot at `path`, loading it if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries: Entries = try_load_snapshot(&path)?.unwrap_or_default();
        info!(path = %path.display(), entries = entries.len(), "Opened ledger");
        Ok(Self {
            entries: Mutex::new(entries),
            snapshot_path: Some(path),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Number of stored entries, live or expired.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn persist(&self, entries: &Entries) -> Result<()> {
        if let Some(path) = &self.snapshot_path {
            save_snapshot(path, entries).await?;
        }
        Ok(())
    }

    /// Persists, restoring `key` to `previous` if the write fails.
    async fn persist_or_restore(
        &self,
        entries: &mut Entries,
        key: &RequestKey,
        previous: Option<LedgerEntry>,
    ) -> Result<()> {
        if let Err(e) = self.persist(entries).await {
            match previous {
                Some(entry) => {
                    entries.insert(key.clone(), entry);
                }
                None => {
                    entries.remove(key);
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

impl IdempotencyLedger for LocalLedger {
    async fn try_claim(&self, entry: LedgerEntry, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(&entry.key)
            && existing.is_live(now)
        {
            return Ok(ClaimOutcome::Held(existing.clone()));
        }

        let key = entry.key.clone();
        let claim_id = entry.claim_id.clone();
        let previous = entries.insert(key.clone(), entry);
        self.persist_or_restore(&mut entries, &key, previous).await?;

        debug!(%key, %claim_id, "Claimed key");
        Ok(ClaimOutcome::Claimed)
    }

    async fn get(&self, key: &RequestKey) -> Result<Option<LedgerEntry>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn mark_committed(
        &self,
        key: &RequestKey,
        claim_id: &ClaimId,
        now: DateTime<Utc>,
    ) -> Result<CommitTransition> {
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries.get_mut(key) else {
            return Ok(CommitTransition::ClaimLost);
        };
        if &entry.claim_id != claim_id {
            return Ok(CommitTransition::ClaimLost);
        }
        if entry.state == ClaimState::Committed {
            return Ok(CommitTransition::AlreadyCommitted);
        }

        let previous = entry.clone();
        entry.state = ClaimState::Committed;
        entry.committed_at = Some(now);
        self.persist_or_restore(&mut entries, key, Some(previous)).await?;

        debug!(%key, %claim_id, "Marked committed");
        Ok(CommitTransition::Committed)
    }

    async fn release(&self, key: &RequestKey, claim_id: &ClaimId) -> Result<bool> {
        let mut entries = self.entries.lock().await;

        let owned = entries
            .get(key)
            .is_some_and(|e| &e.claim_id == claim_id && e.state == ClaimState::Claimed);
        if !owned {
            return Ok(false);
        }

        let previous = entries.remove(key);
        self.persist_or_restore(&mut entries, key, previous).await?;

        debug!(%key, %claim_id, "Released claim");
        Ok(true)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.lock().await;

        let expired: Vec<RequestKey> = entries
            .values()
            .filter(|e| !e.is_live(now))
            .map(|e| e.key.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let removed: Vec<LedgerEntry> = expired.iter().filter_map(|k| entries.remove(k)).collect();
        if let Err(e) = self.persist(&entries).await {
            for entry in removed {
                entries.insert(entry.key.clone(), entry);
            }
            return Err(e);
        }

        Ok(removed.len())
    }
}
