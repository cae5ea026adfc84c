//! Analytics ingestion and cookie consent.

use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{client_ip_hash, parse_json, throttle};
use crate::analytics;
use crate::consent;
use crate::error::ApiError;
use crate::model::{ConsentChoices, VisitorEvent};
use crate::state::AppState;

pub async fn ingest_analytics(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let event: VisitorEvent = parse_json(&body)?;
    let ip_hash = client_ip_hash(&state, &headers);
    throttle(&state, "analytics", &ip_hash, state.config().security.rate_limits.analytics)?;
    let id = analytics::ingest(state.pool(), &ip_hash, &event).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "id": id }))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRequest {
    #[serde(flatten)]
    pub choices: ConsentChoices,
    #[serde(default)]
    pub consent_version: Option<String>,
}

pub async fn record_consent(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: ConsentRequest = parse_json(&body)?;
    let ip_hash = client_ip_hash(&state, &headers);
    throttle(&state, "consent", &ip_hash, state.config().security.rate_limits.consent)?;
    let stored = consent::record(
        state.pool(),
        &ip_hash,
        req.choices,
        req.consent_version.as_deref(),
    )
    .await?;
    Ok(Json(json!({ "success": true, "consent": stored })))
}

pub async fn get_consent(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ip_hash = client_ip_hash(&state, &headers);
    let stored = consent::lookup(state.pool(), &ip_hash).await?;
    Ok(Json(json!({ "consent": stored })))
}
