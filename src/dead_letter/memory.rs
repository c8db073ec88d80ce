//! In-memory dead-letter sink.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{DeadLetterEntry, DeadLetterSink, RejectedCommit, Result};
use crate::types::MessageId;

#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    entries: Mutex<BTreeMap<MessageId, DeadLetterEntry>>,
    rejections: Mutex<Vec<RejectedCommit>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<MessageId, DeadLetterEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rejection_log(&self) -> MutexGuard<'_, Vec<RejectedCommit>> {
        self.rejections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeadLetterSink for MemoryDeadLetterSink {
    fn quarantine(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.entries()
            .insert(entry.item.message_id.clone(), entry.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<DeadLetterEntry>> {
        let mut entries: Vec<_> = self.entries().values().cloned().collect();
        entries.sort_by_key(|e| e.dead_lettered_at);
        Ok(entries)
    }

    fn get(&self, message_id: &MessageId) -> Result<Option<DeadLetterEntry>> {
        Ok(self.entries().get(message_id).cloned())
    }

    fn remove(&self, message_id: &MessageId) -> Result<bool> {
        Ok(self.entries().remove(message_id).is_some())
    }

    fn record_rejection(&self, rejection: &RejectedCommit) -> Result<()> {
        self.rejection_log().push(rejection.clone());
        Ok(())
    }

    fn rejections(&self) -> Result<Vec<RejectedCommit>> {
        Ok(self.rejection_log().clone())
    }
}
