//! Operator endpoints for the dead-letter and rejection channels.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{AppState, ErrorBody};
use crate::dead_letter::{DeadLetterEntry, DeadLetterError, RejectedCommit};
use crate::ledger::IdempotencyLedger;
use crate::queue::WorkQueue;
use crate::types::MessageId;
use crate::verifier::{ReplayError, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayStatus {
    /// Queued again under a new message ID.
    Requeued,
    /// A live claim already covers the pair; the dead letter was dropped.
    Duplicate,
    /// The stored payload no longer validates; the dead letter was kept.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    pub message_id: MessageId,
    pub status: ReplayStatus,
    pub match_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_message_id: Option<MessageId>,
}

fn sink_error(e: &DeadLetterError) -> Response {
    error!(error = %e, "Dead-letter sink failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::new(e.to_string(), Some("DEAD_LETTER_UNAVAILABLE"))),
    )
        .into_response()
}

impl IntoResponse for ReplayError {
    fn into_response(self) -> Response {
        match &self {
            ReplayError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody::new(self.to_string(), Some("NOT_FOUND"))),
            )
                .into_response(),
            ReplayError::DeadLetter(e) => sink_error(e),
            ReplayError::Submit(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody::new(self.to_string(), Some("DEPENDENCY_UNAVAILABLE"))),
            )
                .into_response(),
        }
    }
}

/// `GET /dead-letters`
pub async fn list_dead_letters<L, Q>(
    State(state): State<AppState<L, Q>>,
) -> Result<Json<Vec<DeadLetterEntry>>, Response>
where
    L: IdempotencyLedger + 'static,
    Q: WorkQueue + 'static,
{
    state
        .dead_letters()
        .list()
        .map(Json)
        .map_err(|e| sink_error(&e))
}

/// `GET /rejections`
pub async fn list_rejections<L, Q>(
    State(state): State<AppState<L, Q>>,
) -> Result<Json<Vec<RejectedCommit>>, Response>
where
    L: IdempotencyLedger + 'static,
    Q: WorkQueue + 'static,
{
    state
        .dead_letters()
        .rejections()
        .map(Json)
        .map_err(|e| sink_error(&e))
}

/// `POST /dead-letters/{message_id}/replay`
pub async fn replay_handler<L, Q>(
    State(state): State<AppState<L, Q>>,
    Path(message_id): Path<String>,
) -> Result<(StatusCode, Json<ReplayResponse>), ReplayError>
where
    L: IdempotencyLedger + 'static,
    Q: WorkQueue + 'static,
{
    let message_id = MessageId::new(message_id);
    let verdict = state
        .verifier()
        .replay(state.dead_letters().as_ref(), &message_id)
        .await?;
    info!(%message_id, ?verdict, "Dead letter replayed");

    let (status, response) = match verdict {
        Verdict::Accepted {
            key,
            message_id: new_message_id,
            ..
        } => (
            StatusCode::ACCEPTED,
            ReplayResponse {
                message_id,
                status: ReplayStatus::Requeued,
                match_id: Some(key.to_string()),
                new_message_id: Some(new_message_id),
            },
        ),
        Verdict::Duplicate { key, .. } => (
            StatusCode::OK,
            ReplayResponse {
                message_id,
                status: ReplayStatus::Duplicate,
                match_id: Some(key.to_string()),
                new_message_id: None,
            },
        ),
        Verdict::Rejected(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            ReplayResponse {
                message_id,
                status: ReplayStatus::Rejected,
                match_id: None,
                new_message_id: None,
            },
        ),
    };
    Ok((status, Json(response)))
}
