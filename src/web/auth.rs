//! HTTP basic auth for the admin routes.

use super::AppState;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Reject requests without matching credentials. A no-op when no
/// username/password pair is configured.
pub async fn require_basic_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.config.auth_enabled() {
        return next.run(request).await;
    }

    if credentials(request.headers())
        .is_some_and(|(user, pass)| user == state.config.web_username && pass == state.config.web_password)
    {
        return next.run(request).await;
    }

    tracing::debug!("Rejected unauthenticated request to {}", request.uri().path());
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"meshwatch\"")],
        "Unauthorized",
    )
        .into_response()
}

/// `(username, password)` from an `Authorization: Basic` header.
fn credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
