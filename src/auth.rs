//! Bearer-token authentication and role checks.
//!
//! Tokens are opaque random strings handed out by `create_admin`. Only their
//! SHA-256 hash is stored, so a leaked database does not leak credentials.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::time::Duration as StdDuration;
use tracing::{info, instrument, warn};

use crate::crypto::{random_hex, sha256_hex};
use crate::db::{self, Pool};
use crate::error::ApiError;
use crate::model::{AuditEvent, UserRole};
use crate::session::SessionEvents;

const TOKEN_BYTES: usize = 32;

/// Authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: i64,
    pub token_id: i64,
}

/// Freshly issued token. `token` is shown once and never stored.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token_id: i64,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Extract the credential from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[instrument(skip_all)]
pub async fn authenticate(pool: &Pool, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    let row = db::find_access_token(pool, &sha256_hex(token))
        .await?
        .ok_or(ApiError::Unauthorized)?;
    if !row.is_usable(Utc::now()) {
        return Err(ApiError::Unauthorized);
    }
    Ok(AuthContext {
        user_id: row.user_id,
        token_id: row.id,
    })
}

/// Authenticate and check the admin role. 401 comes before 403.
#[instrument(skip_all)]
pub async fn require_admin(pool: &Pool, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let ctx = authenticate(pool, headers).await?;
    if !db::user_has_role(pool, ctx.user_id, UserRole::Admin).await? {
        record_audit(
            pool,
            AuditEvent::new("admin_access_denied").user(ctx.user_id),
        )
        .await;
        return Err(ApiError::Forbidden("admin role required"));
    }
    Ok(ctx)
}

#[instrument(skip_all)]
pub async fn issue_token(pool: &Pool, user_id: i64, ttl: Duration) -> anyhow::Result<IssuedToken> {
    let token = random_hex(TOKEN_BYTES);
    let expires_at = Utc::now() + ttl;
    let token_id = db::insert_access_token(pool, user_id, &sha256_hex(&token), expires_at).await?;
    Ok(IssuedToken {
        token_id,
        token,
        expires_at,
    })
}

/// Write an audit row. Failures are logged and swallowed.
pub async fn record_audit(pool: &Pool, event: AuditEvent) {
    if let Err(err) = db::insert_audit_event(pool, &event).await {
        warn!(?err, event_type = %event.event_type, "failed to write audit event");
    }
}

/// Timer side effects for a server-tracked session: the forced sign-out
/// revokes the bearer token.
pub struct DbSessionEvents {
    pool: Pool,
    ctx: AuthContext,
}

impl DbSessionEvents {
    pub fn new(pool: Pool, ctx: AuthContext) -> Self {
        Self { pool, ctx }
    }
}

#[async_trait]
impl SessionEvents for DbSessionEvents {
    async fn warn(&self, remaining: StdDuration) {
        info!(
            user_id = self.ctx.user_id,
            remaining_secs = remaining.as_secs(),
            "session about to expire"
        );
    }

    async fn sign_out(&self) {
        match db::revoke_access_token(&self.pool, self.ctx.token_id).await {
            Ok(_) => info!(user_id = self.ctx.user_id, "session signed out after inactivity"),
            Err(err) => warn!(?err, "failed to revoke expired session token"),
        }
        record_audit(
            &self.pool,
            AuditEvent::new("session_timeout")
                .user(self.ctx.user_id)
                .details(json!({ "tokenId": self.ctx.token_id })),
        )
        .await;
    }
}
