//! The external record store boundary.
//!
//! - [`RecordStore`]: commits one batch of records to a table
//! - [`AirtableStore`]: HTTP implementation against the Airtable REST API
//! - [`CommitError`]: failures classified as transient or permanent

pub mod airtable;
pub mod error;

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::types::{StoreRecords, TableName};

pub use airtable::{AirtableConfig, AirtableStore};
pub use error::{CommitError, CommitErrorKind};

/// What the store reported for a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// IDs the store assigned to the created records.
    pub record_ids: Vec<String>,
}

/// Commits records to the external store.
///
/// The call is not idempotent: committing the same records twice creates two
/// rows. Callers are responsible for deduplication.
pub trait RecordStore: Send + Sync {
    fn commit_record(
        &self,
        table: &TableName,
        records: &StoreRecords,
    ) -> impl Future<Output = Result<CommitReceipt, CommitError>> + Send;
}
