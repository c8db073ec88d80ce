//! Inbound match requests and their validation.
//!
//! Requests arrive as flat JSON objects keyed by human-readable field names:
//!
//! ```text
//! {
//!   "Learner": "recJpeIQuMnAlfJ1R",
//!   "Tutor": "recuUhUFHYIQ6B3De",
//!   "Approval Status": "Requested",
//!   "Learner Available Time Slots": ["rec4TUVd3TYRGE285", ...],
//!   "Tutor Available Time Slots": "recGyyimRlFL5WNef"
//! }
//! ```
//!
//! Only `Learner` and `Tutor` are required. Time slots may be a single string
//! or a list of strings. Unknown fields are kept verbatim so a dead-lettered
//! request can be replayed exactly as it was submitted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::ids::{KEY_SEPARATOR, PayloadDigest, RequestKey};

pub const FIELD_LEARNER: &str = "Learner";
pub const FIELD_TUTOR: &str = "Tutor";
pub const FIELD_APPROVAL_STATUS: &str = "Approval Status";
pub const FIELD_LEARNER_SLOTS: &str = "Learner Available Time Slots";
pub const FIELD_TUTOR_SLOTS: &str = "Tutor Available Time Slots";

/// Maximum length of a participant identifier in bytes.
const MAX_IDENTIFIER_LEN: usize = 128;

/// Reasons a request is rejected before anything is claimed or enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The body is not valid JSON.
    #[error("invalid JSON in request body: {0}")]
    InvalidJson(String),

    /// The body is JSON but not an object.
    #[error("request body must be a JSON object")]
    NotAnObject,

    /// A required field is absent, null or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A field is present but malformed.
    #[error("invalid field {field:?}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    /// Machine-readable code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidJson(_) | ValidationError::NotAnObject => "INVALID_JSON",
            ValidationError::MissingField(_) => "MISSING_FIELDS",
            ValidationError::InvalidField { .. } => "INVALID_FIELD",
        }
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// A validated match request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRequest {
    #[serde(rename = "Learner")]
    pub learner: String,

    #[serde(rename = "Tutor")]
    pub tutor: String,

    #[serde(
        rename = "Approval Status",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub approval_status: Option<String>,

    #[serde(
        rename = "Learner Available Time Slots",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub learner_time_slots: Vec<String>,

    #[serde(
        rename = "Tutor Available Time Slots",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tutor_time_slots: Vec<String>,

    /// Fields this service doesn't interpret, kept for replay.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MatchRequest {
    /// Parses and validates a raw request body.
    pub fn parse(body: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validates an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut fields) = value else {
            return Err(ValidationError::NotAnObject);
        };

        let learner = take_identifier(&mut fields, FIELD_LEARNER)?;
        let tutor = take_identifier(&mut fields, FIELD_TUTOR)?;
        let approval_status = take_optional_string(&mut fields, FIELD_APPROVAL_STATUS)?;
        let learner_time_slots = take_time_slots(&mut fields, FIELD_LEARNER_SLOTS)?;
        let tutor_time_slots = take_time_slots(&mut fields, FIELD_TUTOR_SLOTS)?;

        Ok(MatchRequest {
            learner,
            tutor,
            approval_status,
            learner_time_slots,
            tutor_time_slots,
            extra: fields.into_iter().collect(),
        })
    }

    /// The logical key this request deduplicates on.
    pub fn key(&self) -> RequestKey {
        RequestKey::for_pair(&self.learner, &self.tutor)
    }

    /// The request as a flat JSON object, in the shape it was submitted.
    pub fn to_value(&self) -> Value {
        let mut fields: Map<String, Value> = self
            .extra
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        fields.insert(FIELD_LEARNER.to_string(), Value::from(self.learner.as_str()));
        fields.insert(FIELD_TUTOR.to_string(), Value::from(self.tutor.as_str()));
        if let Some(status) = &self.approval_status {
            fields.insert(FIELD_APPROVAL_STATUS.to_string(), Value::from(status.as_str()));
        }
        if !self.learner_time_slots.is_empty() {
            fields.insert(
                FIELD_LEARNER_SLOTS.to_string(),
                Value::from(self.learner_time_slots.clone()),
            );
        }
        if !self.tutor_time_slots.is_empty() {
            fields.insert(
                FIELD_TUTOR_SLOTS.to_string(),
                Value::from(self.tutor_time_slots.clone()),
            );
        }
        Value::Object(fields)
    }

    /// Digest of the canonical serialization.
    ///
    /// Object keys are written in sorted order, so the digest doesn't depend
    /// on the raw field order.
    pub fn digest(&self) -> PayloadDigest {
        let canonical = self.to_value().to_string();
        PayloadDigest(hex::encode(Sha256::digest(canonical.as_bytes())))
    }
}

fn take_identifier(
    fields: &mut Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    let id = match fields.remove(field) {
        None | Some(Value::Null) => return Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) if s.is_empty() => {
            return Err(ValidationError::MissingField(field));
        }
        Some(Value::String(s)) => s,
        Some(_) => return Err(ValidationError::invalid(field, "must be a string")),
    };

    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::invalid(
            field,
            format!("longer than {MAX_IDENTIFIER_LEN} bytes"),
        ));
    }
    if id.contains(KEY_SEPARATOR) {
        return Err(ValidationError::invalid(
            field,
            format!("must not contain {KEY_SEPARATOR:?}"),
        ));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::invalid(
            field,
            "must not contain whitespace or control characters",
        ));
    }

    Ok(id)
}

fn take_optional_string(
    fields: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match fields.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ValidationError::invalid(field, "must be a string")),
    }
}

/// A single string is treated as a one-element list.
fn take_time_slots(
    fields: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Vec<String>, ValidationError> {
    let slots = match fields.remove(field) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(ValidationError::invalid(
                    field,
                    "time slots must be a string or list of strings",
                )),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(ValidationError::invalid(
                field,
                "time slots must be a string or list of strings",
            ));
        }
    };

    if slots.iter().any(|s| s.is_empty()) {
        return Err(ValidationError::invalid(field, "time slot must not be empty"));
    }

    Ok(slots)
}
