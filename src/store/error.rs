//! External store error types.
//!
//! Commit failures are split by what the worker should do next:
//!
//! - **Transient** errors leave the delivery unacknowledged so it is redelivered
//!   (timeouts, connection failures, 408, 429, 5xx)
//! - **Permanent** errors are acknowledged and recorded for operators (other 4xx,
//!   success responses we can't decode)

use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

/// The kind of commit error, categorized for redelivery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitErrorKind {
    /// Redelivery may succeed.
    Transient,

    /// Redelivery would fail the same way.
    Permanent,
}

impl CommitErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, CommitErrorKind::Transient)
    }
}

/// A failed commit against the external store.
#[derive(Debug, Error)]
pub struct CommitError {
    pub kind: CommitErrorKind,

    /// The HTTP status code, if the store answered.
    pub status_code: Option<u16>,

    pub message: String,

    #[source]
    pub source: Option<reqwest::Error>,
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "store error (HTTP {code}): {}", self.message),
            None => write!(f, "store error: {}", self.message),
        }
    }
}

impl CommitError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: CommitErrorKind::Transient,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: CommitErrorKind::Permanent,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    /// Categorizes a non-success HTTP response.
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind: kind_for_status(status),
            status_code: Some(status.as_u16()),
            message: message.into(),
            source: None,
        }
    }

    /// Categorizes a transport-level error.
    ///
    /// Anything that failed before a response arrived is transient, except a
    /// request we couldn't even build.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let status_code = err.status().map(|s| s.as_u16());
        let kind = if let Some(status) = err.status() {
            kind_for_status(status)
        } else if err.is_builder() || err.is_decode() {
            CommitErrorKind::Permanent
        } else {
            CommitErrorKind::Transient
        };

        Self {
            kind,
            status_code,
            message: err.to_string(),
            source: Some(err),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

fn kind_for_status(status: StatusCode) -> CommitErrorKind {
    match status.as_u16() {
        408 | 429 => CommitErrorKind::Transient,
        code if (500..600).contains(&code) => CommitErrorKind::Transient,
        _ => CommitErrorKind::Permanent,
    }
}
