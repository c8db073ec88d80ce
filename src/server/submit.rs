//! Match request intake.
//!
//! Runs the verifier on the raw body and maps its verdict to a status code.
//! Nothing here touches the external store: an accepted request is only
//! claimed and queued.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use super::{AppState, ErrorBody};
use crate::ledger::IdempotencyLedger;
use crate::queue::WorkQueue;
use crate::types::{InvalidTableName, TableName, ValidationError};
use crate::verifier::{SubmitError, Verdict};

pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_FAILED: &str = "FAILED";

/// Body of 202 and 409 responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub message: String,
    pub match_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitRejection {
    #[error(transparent)]
    InvalidTable(#[from] InvalidTableName),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Unavailable(#[from] SubmitError),
}

impl IntoResponse for SubmitRejection {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            SubmitRejection::InvalidTable(_) => (StatusCode::BAD_REQUEST, "INVALID_TABLE"),
            SubmitRejection::Invalid(e) => (StatusCode::BAD_REQUEST, e.code()),
            SubmitRejection::Unavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "DEPENDENCY_UNAVAILABLE")
            }
        };
        (status, Json(ErrorBody::new(self.to_string(), Some(code)))).into_response()
    }
}

/// `POST /matches/{table}`
///
/// - 202: claimed and queued
/// - 409: the learner/tutor pair already has a live claim
/// - 400: malformed body or table name
/// - 503: the ledger or queue failed; safe to retry
pub async fn submit_handler<L, Q>(
    State(state): State<AppState<L, Q>>,
    Path(table): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), SubmitRejection>
where
    L: IdempotencyLedger + 'static,
    Q: WorkQueue + 'static,
{
    let table = TableName::parse(table)?;

    match state.verifier().submit(&table, &body).await {
        Ok(Verdict::Accepted { key, message_id, .. }) => {
            info!(%table, %key, %message_id, "Match request queued");
            Ok((
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    message: "Request queued successfully".to_string(),
                    match_id: key.to_string(),
                    status: STATUS_PENDING.to_string(),
                    error: None,
                }),
            ))
        }
        Ok(Verdict::Duplicate { key, .. }) => Ok((
            StatusCode::CONFLICT,
            Json(SubmitResponse {
                message: "Match request already exists".to_string(),
                match_id: key.to_string(),
                status: STATUS_FAILED.to_string(),
                error: Some("DUPLICATE_REQUEST".to_string()),
            }),
        )),
        Ok(Verdict::Rejected(e)) => Err(e.into()),
        Err(e) => {
            error!(%table, error = %e, "Submission failed");
            Err(e.into())
        }
    }
}
