//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., passing a
//! claim ID where a message ID is expected) and make signatures self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use ulid::Ulid;

/// Separator between the participant identifiers of a [`RequestKey`].
pub const KEY_SEPARATOR: char = '#';

/// Logical identity of a match request, used for deduplication.
///
/// Derived from the ordered pair (learner, tutor) as `<learner>#<tutor>`.
/// Participant identifiers never contain the separator (see request
/// validation), so distinct pairs never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    /// Derives the key for a learner/tutor pair.
    pub fn for_pair(learner: &str, tutor: &str) -> Self {
        RequestKey(format!("{learner}{KEY_SEPARATOR}{tutor}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generates a fresh, time-ordered identifier.
            pub fn generate() -> Self {
                $name(Ulid::new().to_string())
            }

            pub fn new(s: impl Into<String>) -> Self {
                $name(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

ulid_id!(
    /// Identifies one claim cycle of a key in the ledger.
    ///
    /// A key that expires and is claimed again gets a new claim ID, which is
    /// how stale work items from an earlier cycle are recognised.
    ClaimId
);

ulid_id!(
    /// Identifies a work item for its whole life in the queue and dead-letter sink.
    MessageId
);

ulid_id!(
    /// Proof of holding the lease for one delivery attempt.
    LeaseToken
);

/// Maximum length of a table name in bytes.
const MAX_TABLE_NAME_LEN: usize = 255;

/// Error returned for table names that can't be used as a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "invalid table name {0:?}: must be 1-255 bytes, not '.' or '..', with no '/' or control characters"
)]
pub struct InvalidTableName(pub String);

/// Name of the external store table a request is committed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    /// Validates a table name taken from the request path.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidTableName> {
        let s = s.into();
        // "." and ".." would be collapsed out of the store URL's path.
        let valid = !s.trim().is_empty()
            && s != "."
            && s != ".."
            && s.len() <= MAX_TABLE_NAME_LEN
            && !s.chars().any(|c| c == '/' || c.is_control());
        if valid {
            Ok(TableName(s))
        } else {
            Err(InvalidTableName(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 of a request's canonical payload, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadDigest(pub String);

impl PayloadDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (12-character) prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for PayloadDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
