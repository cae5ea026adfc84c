//! Session status, activity pings, CSRF issue and sign-out.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_json, session_context};
use crate::auth::record_audit;
use crate::db;
use crate::error::ApiError;
use crate::model::{AuditEvent, UserRole};
use crate::security::csrf::CSRF_HEADER;
use crate::session::ActivitySignal;
use crate::state::AppState;

pub async fn session_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = session_context(&state, &headers).await?;
    let status = state
        .sessions()
        .status(ctx.token_id)
        .ok_or(ApiError::Unauthorized)?;
    let is_admin = db::user_has_role(state.pool(), ctx.user_id, UserRole::Admin).await?;
    let config = state.sessions().config();
    Ok(Json(json!({
        "userId": ctx.user_id,
        "isAdmin": is_admin,
        "session": status,
        "timeoutSecs": config.window.as_secs(),
        "warningSecs": config.warning_lead.as_secs(),
    })))
}

/// Either a signal name (`key_press`) or the raw DOM event (`keydown`).
#[derive(Debug, Deserialize)]
pub struct ActivityRequest {
    #[serde(default)]
    pub signal: Option<ActivitySignal>,
    #[serde(default)]
    pub event: Option<String>,
}

pub async fn record_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: ActivityRequest = parse_json(&body)?;
    let signal = req
        .signal
        .or_else(|| req.event.as_deref().and_then(ActivitySignal::from_dom_event))
        .ok_or_else(|| ApiError::bad_request("unknown activity signal"))?;
    let ctx = session_context(&state, &headers).await?;
    if !state.sessions().touch(ctx.token_id, signal) {
        state.sessions().end(ctx.token_id);
        return Err(ApiError::Unauthorized);
    }
    Ok(Json(json!({ "session": state.sessions().status(ctx.token_id) })))
}

pub async fn csrf_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = session_context(&state, &headers).await?;
    let token = state
        .sessions()
        .csrf_token(ctx.token_id)
        .ok_or(ApiError::Unauthorized)?;
    Ok(Json(json!({ "token": token, "header": CSRF_HEADER })))
}

pub async fn sign_out(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = crate::auth::authenticate(state.pool(), &headers).await?;
    state.sessions().end(ctx.token_id);
    db::revoke_access_token(state.pool(), ctx.token_id).await?;
    record_audit(state.pool(), AuditEvent::new("sign_out").user(ctx.user_id)).await;
    Ok(Json(json!({ "success": true })))
}
