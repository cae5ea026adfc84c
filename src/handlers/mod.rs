//! Edge-function handlers.
//!
//! Every handler is stateless apart from [`AppState`]. Security checks
//! (consent, bearer token, role, CSRF, rate limit) run before the handler
//! touches any data.

use axum::http::HeaderMap;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::analytics::hash_ip;
use crate::auth::{self, AuthContext, DbSessionEvents};
use crate::error::ApiError;
use crate::security::csrf::CSRF_HEADER;
use crate::security::rate_limit::RateLimitRule;
use crate::state::AppState;

pub mod admin;
pub mod content;
pub mod feeds;
pub mod health;
pub mod integrations;
pub mod security;
pub mod session;
pub mod shell;
pub mod visitors;

/// Parse a JSON body, answering malformed input with a JSON 400.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))
}

/// Client address as reported by the fronting proxy.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded.or(real).unwrap_or("unknown").to_string()
}

pub(crate) fn client_ip_hash(state: &AppState, headers: &HeaderMap) -> String {
    hash_ip(&state.config().security.ip_hash_salt, &client_ip(headers))
}

/// Apply a throttle rule to `key` within the `scope` namespace.
pub(crate) fn throttle(
    state: &AppState,
    scope: &str,
    key: &str,
    rule: RateLimitRule,
) -> Result<(), ApiError> {
    let key = format!("{scope}:{key}");
    if state.limiter().check(&key, rule) {
        return Ok(());
    }
    Err(ApiError::RateLimited {
        retry_after_ms: state.limiter().remaining_time(&key, rule),
    })
}

/// Authenticate and make sure the caller's inactivity timers are running.
pub(crate) async fn session_context(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, ApiError> {
    let ctx = auth::authenticate(state.pool(), headers).await?;
    track_session(state, ctx);
    Ok(ctx)
}

pub(crate) async fn admin_context(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, ApiError> {
    let ctx = auth::require_admin(state.pool(), headers).await?;
    track_session(state, ctx);
    Ok(ctx)
}

fn track_session(state: &AppState, ctx: AuthContext) {
    state.sessions().begin(
        ctx.token_id,
        Arc::new(DbSessionEvents::new(state.pool().clone(), ctx)),
    );
}

/// State-changing admin calls must echo the session's CSRF token.
pub(crate) fn require_csrf(
    state: &AppState,
    ctx: &AuthContext,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let candidate = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::CsrfRejected)?;
    if state.sessions().validate_csrf(ctx.token_id, candidate) {
        Ok(())
    } else {
        Err(ApiError::CsrfRejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_for_wins() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "unknown");
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_ip(&headers), "10.0.0.2");
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(client_ip(&headers), "203.0.113.9");
    }
}
