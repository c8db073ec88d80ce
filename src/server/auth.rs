//! Bearer-token authentication for the front door.
//!
//! The expected token comes from configuration and is compared in constant
//! time. A request without usable credentials gets 401; a request with the
//! wrong token gets 403.

use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use super::ErrorBody;

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Clone)]
pub struct ApiToken(Arc<str>);

impl ApiToken {
    pub fn new(token: impl Into<String>) -> Self {
        ApiToken(Arc::from(token.into()))
    }

    /// Constant-time comparison against a presented token.
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiToken(<redacted>)")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("invalid bearer token")]
    Invalid,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = ErrorBody::new(self.to_string(), None);
        match self {
            AuthError::Missing => {
                let mut response = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            AuthError::Invalid => (StatusCode::FORBIDDEN, Json(body)).into_response(),
        }
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .get(..BEARER_PREFIX.len())
        .filter(|scheme| scheme.eq_ignore_ascii_case(BEARER_PREFIX))
        .map(|_| value[BEARER_PREFIX.len()..].trim())?;
    (!token.is_empty()).then_some(token)
}

/// Middleware rejecting requests that don't carry the configured token.
pub async fn require_bearer(
    State(token): State<ApiToken>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(presented) = bearer_token(request.headers()) else {
        warn!(path = %request.uri().path(), "Request without bearer token");
        return Err(AuthError::Missing);
    };
    if !token.matches(presented) {
        warn!(path = %request.uri().path(), "Request with invalid bearer token");
        return Err(AuthError::Invalid);
    }

    Ok(next.run(request).await)
}
