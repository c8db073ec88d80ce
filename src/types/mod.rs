//! Core domain types for the match coordinator.
//!
//! Identifiers are newtypes so a claim ID can't be passed where a message ID
//! is expected, and requests only exist in their validated form.

pub mod ids;
pub mod record;
pub mod request;

pub use ids::{
    ClaimId, InvalidTableName, KEY_SEPARATOR, LeaseToken, MessageId, PayloadDigest, RequestKey,
    TableName,
};
pub use record::{MatchRecord, RecordFields, StoreRecords};
pub use request::{MatchRequest, ValidationError};
