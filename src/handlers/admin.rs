//! Admin-only edge functions.
//!
//! Every handler authenticates and checks the admin role first; mutations
//! also require the session's CSRF token.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{admin_context, parse_json, require_csrf, throttle};
use crate::auth::record_audit;
use crate::db;
use crate::error::ApiError;
use crate::model::{ArticleDraft, AuditEvent, SocialPlatform};
use crate::security::sanitize::sanitize_html;
use crate::state::AppState;
use crate::tokens::migrate_plaintext_tokens;

/// User search never returns more than this many rows.
pub const MAX_SEARCH_RESULTS: i64 = 10;

static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid slug regex"));

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|e| e.is_unique_violation())
}

#[derive(Debug, Deserialize)]
pub struct UserSearchRequest {
    #[serde(default)]
    pub email: String,
}

pub async fn search_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let ctx = admin_context(&state, &headers).await?;
    throttle(
        &state,
        "admin_search",
        &ctx.user_id.to_string(),
        state.config().security.rate_limits.admin_search,
    )?;
    let req: UserSearchRequest = parse_json(&body)?;
    let users = db::search_users(state.pool(), &req.email, MAX_SEARCH_RESULTS).await?;
    record_audit(
        state.pool(),
        AuditEvent::new("admin_user_search")
            .user(ctx.user_id)
            .details(json!({ "results": users.len() })),
    )
    .await;
    Ok(Json(json!({ "users": users })))
}

/// Validate and sanitize an article before it is stored.
fn prepare_article(mut draft: ArticleDraft) -> Result<ArticleDraft, ApiError> {
    draft.slug = draft.slug.trim().to_ascii_lowercase();
    if !SLUG_RE.is_match(&draft.slug) {
        return Err(ApiError::bad_request("slug must be lowercase words joined by '-'"));
    }
    draft.title = draft.title.trim().to_string();
    if draft.title.is_empty() {
        return Err(ApiError::bad_request("title is required"));
    }
    draft.content = sanitize_html(&draft.content);
    if draft.content.trim().is_empty() {
        return Err(ApiError::bad_request("content is empty after sanitization"));
    }
    draft.excerpt = draft
        .excerpt
        .map(|e| sanitize_html(e.trim()))
        .filter(|e| !e.is_empty());
    Ok(draft)
}

pub async fn create_article(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ctx = admin_context(&state, &headers).await?;
    require_csrf(&state, &ctx, &headers)?;
    let draft = prepare_article(parse_json(&body)?)?;
    let id = match db::insert_article(state.pool(), &draft, Some(ctx.user_id)).await {
        Ok(id) => id,
        Err(err) if is_unique_violation(&err) => {
            return Err(ApiError::bad_request("slug already exists"))
        }
        Err(err) => return Err(err.into()),
    };
    record_audit(
        state.pool(),
        AuditEvent::new("article_created")
            .user(ctx.user_id)
            .details(json!({ "articleId": id, "slug": draft.slug })),
    )
    .await;
    Ok((StatusCode::CREATED, Json(json!({ "id": id, "slug": draft.slug }))))
}

pub async fn update_article(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let ctx = admin_context(&state, &headers).await?;
    require_csrf(&state, &ctx, &headers)?;
    let draft = prepare_article(parse_json(&body)?)?;
    let updated = match db::update_article(state.pool(), id, &draft).await {
        Ok(updated) => updated,
        Err(err) if is_unique_violation(&err) => {
            return Err(ApiError::bad_request("slug already exists"))
        }
        Err(err) => return Err(err.into()),
    };
    if !updated {
        return Err(ApiError::NotFound("article"));
    }
    record_audit(
        state.pool(),
        AuditEvent::new("article_updated")
            .user(ctx.user_id)
            .details(json!({ "articleId": id })),
    )
    .await;
    Ok(Json(json!({ "id": id, "slug": draft.slug })))
}

#[derive(Debug, Deserialize)]
pub struct ContentRequest {
    #[serde(default)]
    pub title: Option<String>,
    pub body: String,
}

pub async fn update_content(
    State(state): State<AppState>,
    Path(section): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let ctx = admin_context(&state, &headers).await?;
    require_csrf(&state, &ctx, &headers)?;
    let req: ContentRequest = parse_json(&body)?;
    let section = section.trim();
    if section.is_empty() {
        return Err(ApiError::bad_request("section is required"));
    }
    let html = sanitize_html(&req.body);
    db::upsert_content_section(
        state.pool(),
        section,
        req.title.as_deref().map(str::trim),
        &html,
        Some(ctx.user_id),
    )
    .await?;
    record_audit(
        state.pool(),
        AuditEvent::new("content_updated")
            .user(ctx.user_id)
            .details(json!({ "section": section })),
    )
    .await;
    Ok(Json(json!({ "section": section, "body": html })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialPostRequest {
    pub platform: SocialPlatform,
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Defaults to now, which publishes on the next worker tick.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

pub async fn schedule_social_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ctx = admin_context(&state, &headers).await?;
    require_csrf(&state, &ctx, &headers)?;
    let req: SocialPostRequest = parse_json(&body)?;
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::bad_request("content is required"));
    }
    if req.platform == SocialPlatform::Instagram && req.image_url.is_none() {
        return Err(ApiError::bad_request("instagram posts need an imageUrl"));
    }
    let scheduled_at = req.scheduled_at.unwrap_or_else(Utc::now);
    let id = db::insert_social_post(
        state.pool(),
        req.platform,
        content,
        req.image_url.as_deref(),
        scheduled_at,
        Some(ctx.user_id),
    )
    .await?;
    info!(id, platform = req.platform.as_str(), "social post scheduled");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": id, "status": "scheduled", "scheduledAt": scheduled_at })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub text: String,
}

/// Publish to LinkedIn right away, bypassing the outbox.
pub async fn publish_linkedin(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let ctx = admin_context(&state, &headers).await?;
    require_csrf(&state, &ctx, &headers)?;
    let req: PublishRequest = parse_json(&body)?;
    let text = req.text.trim();
    if text.is_empty() {
        return Err(ApiError::bad_request("text is required"));
    }
    let external_id = state
        .linkedin()
        .publish_text(text)
        .await
        .map_err(|err| ApiError::Upstream(format!("{err:#}")))?;
    let id = db::upsert_ingested_social_post(
        state.pool(),
        SocialPlatform::LinkedIn,
        &external_id,
        text,
        None,
        Utc::now(),
    )
    .await?;
    record_audit(
        state.pool(),
        AuditEvent::new("linkedin_published")
            .user(ctx.user_id)
            .details(json!({ "postId": id, "externalId": external_id })),
    )
    .await;
    Ok(Json(json!({ "id": id, "externalId": external_id })))
}

pub async fn token_migration(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = admin_context(&state, &headers).await?;
    require_csrf(&state, &ctx, &headers)?;
    let migrated = migrate_plaintext_tokens(state.pool(), state.cipher()).await?;
    record_audit(
        state.pool(),
        AuditEvent::new("token_migration")
            .user(ctx.user_id)
            .details(json!({ "migrated": migrated })),
    )
    .await;
    Ok(Json(json!({ "success": true, "migrated": migrated })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArticleStatus;

    fn draft(slug: &str, content: &str) -> ArticleDraft {
        ArticleDraft {
            slug: slug.into(),
            title: " Outlook ".into(),
            excerpt: Some("<p></p>".into()),
            content: content.into(),
            category: None,
            author: None,
            status: ArticleStatus::Draft,
        }
    }

    #[test]
    fn articles_are_sanitized_before_storage() {
        let prepared = prepare_article(draft("Q3-Outlook", "<p>Thhhe view</p><p> </p>")).unwrap();
        assert_eq!(prepared.slug, "q3-outlook");
        assert_eq!(prepared.title, "Outlook");
        assert_eq!(prepared.content, "<p>The view</p>");
        assert_eq!(prepared.excerpt, None);
    }

    #[test]
    fn bad_articles_are_rejected() {
        assert!(prepare_article(draft("no spaces", "<p>x</p>")).is_err());
        assert!(prepare_article(draft("ok", "<div><br></div>")).is_err());
    }
}
