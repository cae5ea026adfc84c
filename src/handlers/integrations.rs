//! Third-party proxies and webhooks.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

use super::parse_json;
use crate::db;
use crate::error::ApiError;
use crate::integrations::calendly::{self, BridgeOutcome, CalendlyMessage};
use crate::integrations::{fred, instagram, linkedin, verify_signature};
use crate::model::{LinkedInPost, SocialPlatform};
use crate::state::AppState;

const LINKEDIN_FEED_LIMIT: i64 = 20;

#[derive(Debug, Deserialize)]
pub struct ObservationQuery {
    pub limit: Option<u32>,
}

pub async fn economic_data(
    State(state): State<AppState>,
    Path(series_id): Path<String>,
    Query(query): Query<ObservationQuery>,
) -> Result<Json<Value>, ApiError> {
    let series_id = fred::normalize_series_id(&series_id)
        .ok_or_else(|| ApiError::bad_request("invalid series id"))?;
    let limit = query.limit.unwrap_or(fred::DEFAULT_LIMIT);
    let observations = state
        .fred()
        .observations(&series_id, limit)
        .await
        .map_err(|err| ApiError::Upstream(format!("{err:#}")))?;
    Ok(Json(json!({
        "seriesId": series_id,
        "observations": observations,
    })))
}

pub async fn calendly_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let msg: CalendlyMessage = parse_json(&body)?;
    match calendly::handle_message(state.pool(), &msg).await? {
        BridgeOutcome::Rejected => Err(ApiError::Forbidden("origin not allowed")),
        outcome => Ok(Json(json!({ "outcome": outcome.as_str() }))),
    }
}

/// Check a webhook signature when a secret is configured.
fn check_signature(
    secret: Option<&str>,
    headers: &HeaderMap,
    header_name: &str,
    body: &[u8],
) -> Result<(), ApiError> {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let provided = headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Forbidden("missing webhook signature"))?;
    if verify_signature(secret, body, provided) {
        Ok(())
    } else {
        warn!(header_name, "webhook signature mismatch");
        Err(ApiError::Forbidden("invalid webhook signature"))
    }
}

pub async fn instagram_verify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, ApiError> {
    let expected = &state.config().integrations.instagram.verify_token;
    instagram::verify_subscription(&params, expected)
        .map(str::to_string)
        .ok_or(ApiError::Forbidden("verification failed"))
}

pub async fn instagram_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = state.config().integrations.instagram.app_secret.as_deref();
    check_signature(secret, &headers, "x-hub-signature-256", &body)?;
    let changes =
        instagram::parse_webhook(&body).map_err(|_| ApiError::bad_request("invalid webhook payload"))?;
    for change in &changes {
        db::upsert_ingested_social_post(
            state.pool(),
            SocialPlatform::Instagram,
            &change.media_id,
            &change.caption,
            change.media_url.as_deref(),
            change.timestamp,
        )
        .await?;
    }
    info!(count = changes.len(), "instagram webhook ingested");
    Ok(Json(json!({ "ingested": changes.len() })))
}

pub async fn linkedin_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = state.config().integrations.linkedin.client_secret.as_deref();
    check_signature(secret, &headers, "x-li-signature", &body)?;
    let posts =
        linkedin::parse_webhook(&body).map_err(|_| ApiError::bad_request("invalid webhook payload"))?;
    for post in &posts {
        db::upsert_linkedin_post(state.pool(), post).await?;
    }
    info!(count = posts.len(), "linkedin webhook ingested");
    Ok(Json(json!({ "ingested": posts.len() })))
}

/// Mirrored LinkedIn posts for the insights page.
pub async fn linkedin_feed(
    State(state): State<AppState>,
) -> Result<Json<Vec<LinkedInPost>>, ApiError> {
    Ok(Json(db::linkedin_posts(state.pool(), LINKEDIN_FEED_LIMIT).await?))
}
