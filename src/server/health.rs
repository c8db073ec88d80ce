//! Liveness check.
//!
//! Unauthenticated. Reports queue depth when the queue answers in time and
//! 503 when it doesn't, so a wedged queue shows up in the orchestrator.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use tracing::warn;

use super::AppState;
use crate::ledger::IdempotencyLedger;
use crate::queue::{QueueStats, WorkQueue};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueStats>,
}

/// `GET /health`
pub async fn health_handler<L, Q>(
    State(state): State<AppState<L, Q>>,
) -> (StatusCode, Json<HealthResponse>)
where
    L: IdempotencyLedger + 'static,
    Q: WorkQueue + 'static,
{
    let timeout = state.verifier().config().dependency_timeout;
    match tokio::time::timeout(timeout, state.queue().stats()).await {
        Ok(Ok(stats)) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                queue: Some(stats),
            }),
        ),
        Ok(Err(e)) => {
            warn!(error = %e, "Health check: queue unavailable");
            unavailable()
        }
        Err(_) => {
            warn!(?timeout, "Health check: queue timed out");
            unavailable()
        }
    }
}

fn unavailable() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(HealthResponse {
            status: "unavailable",
            queue: None,
        }),
    )
}
