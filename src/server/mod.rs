//! HTTP front door for the match coordinator.
//!
//! # Endpoints
//!
//! - `POST /matches/{table}` - Submits a match request (202, 409, 400 or 503)
//! - `GET /dead-letters` - Lists dead-lettered work items
//! - `POST /dead-letters/{message_id}/replay` - Resubmits a dead letter
//! - `GET /rejections` - Lists commits given up on without redelivery
//! - `GET /health` - Liveness check, the only unauthenticated route
//!
//! Everything except `/health` requires `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};

pub mod auth;
pub mod dead_letter;
pub mod health;
pub mod submit;

pub use auth::{ApiToken, AuthError, require_bearer};
pub use dead_letter::{
    ReplayResponse, ReplayStatus, list_dead_letters, list_rejections, replay_handler,
};
pub use health::health_handler;
pub use submit::{SubmitRejection, SubmitResponse, submit_handler};

use crate::dead_letter::DeadLetterSink;
use crate::ledger::IdempotencyLedger;
use crate::queue::WorkQueue;
use crate::verifier::Verifier;

/// JSON body of error responses: `{"message": ..., "error": CODE}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, code: Option<&str>) -> Self {
        ErrorBody {
            message: message.into(),
            error: code.map(str::to_string),
        }
    }
}

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
pub struct AppState<L, Q> {
    inner: Arc<AppStateInner<L, Q>>,
}

struct AppStateInner<L, Q> {
    verifier: Arc<Verifier<L, Q>>,
    queue: Arc<Q>,
    dead_letters: Arc<dyn DeadLetterSink>,
    api_token: ApiToken,
}

impl<L, Q> Clone for AppState<L, Q> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L, Q> AppState<L, Q>
where
    L: IdempotencyLedger,
    Q: WorkQueue,
{
    pub fn new(
        verifier: Arc<Verifier<L, Q>>,
        queue: Arc<Q>,
        dead_letters: Arc<dyn DeadLetterSink>,
        api_token: ApiToken,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                verifier,
                queue,
                dead_letters,
                api_token,
            }),
        }
    }

    pub fn verifier(&self) -> &Arc<Verifier<L, Q>> {
        &self.inner.verifier
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.inner.queue
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterSink> {
        &self.inner.dead_letters
    }

    pub fn api_token(&self) -> &ApiToken {
        &self.inner.api_token
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<L, Q>(app_state: AppState<L, Q>) -> Router
where
    L: IdempotencyLedger + 'static,
    Q: WorkQueue + 'static,
{
    let authenticated = Router::new()
        .route("/matches/{table}", post(submit_handler::<L, Q>))
        .route("/dead-letters", get(list_dead_letters::<L, Q>))
        .route(
            "/dead-letters/{message_id}/replay",
            post(replay_handler::<L, Q>),
        )
        .route("/rejections", get(list_rejections::<L, Q>))
        .route_layer(middleware::from_fn_with_state(
            app_state.api_token().clone(),
            require_bearer,
        ));

    Router::new()
        .merge(authenticated)
        .route("/health", get(health_handler::<L, Q>))
        .with_state(app_state)
}
