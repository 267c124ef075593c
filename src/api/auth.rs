//! Owner-only route guard.
//!
//! Pool withdrawals act on behalf of the configured pool owner, so the caller proves it is the
//! operator with a shared bearer token instead of naming an address in the request body.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use super::routes::AppState;
use crate::error::ErrorClass;

/// Reject the request unless it carries `Authorization: Bearer <admin token>`.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let expected = state.admin_token.as_deref().ok_or(AuthError::Disabled)?;

    let header = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?;
    let token = header
        .to_str()
        .ok()
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(AuthError::InvalidFormat)?;

    if !tokens_match(token, expected) {
        tracing::warn!(path = %req.uri().path(), "Rejected owner request with a bad token");
        return Err(AuthError::InvalidToken);
    }

    Ok(next.run(req).await)
}

/// Compare without short-circuiting on the first differing byte.
fn tokens_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// No admin token configured, owner routes are off.
    Disabled,
    MissingToken,
    InvalidFormat,
    InvalidToken,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Disabled => "owner_routes_disabled",
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidFormat => "invalid_token_format",
            AuthError::InvalidToken => "invalid_token",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::Disabled => (StatusCode::FORBIDDEN, "Owner routes are disabled"),
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidFormat => (
                StatusCode::UNAUTHORIZED,
                "Invalid authorization format. Use: Bearer {token}",
            ),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
        };
        let body = json!({
            "error": message,
            "kind": ErrorClass::Input,
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}
