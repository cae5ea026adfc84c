//! Public content reads and the sanitizer preview.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::parse_json;
use crate::db;
use crate::error::ApiError;
use crate::model::{Article, Partner, WebsiteContent};
use crate::security::sanitize::{sanitize_form, sanitize_html};
use crate::state::AppState;

const DEFAULT_ARTICLE_LIMIT: i64 = 20;
const MAX_ARTICLE_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

pub async fn list_articles(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Article>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ARTICLE_LIMIT)
        .clamp(1, MAX_ARTICLE_LIMIT);
    Ok(Json(db::published_articles(state.pool(), limit).await?))
}

pub async fn get_article(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Article>, ApiError> {
    db::article_by_slug(state.pool(), &slug)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound("article"))
}

pub async fn partners(State(state): State<AppState>) -> Result<Json<Vec<Partner>>, ApiError> {
    Ok(Json(db::active_partners(state.pool()).await?))
}

pub async fn content_section(
    State(state): State<AppState>,
    Path(section): Path<String>,
) -> Result<Json<WebsiteContent>, ApiError> {
    db::content_section(state.pool(), &section)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound("content section"))
}

/// Either one HTML fragment or a whole form.
#[derive(Debug, Deserialize)]
pub struct SanitizeRequest {
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub fields: Option<BTreeMap<String, String>>,
}

/// Run the same gate the write paths use, so a preview matches what gets
/// stored.
pub async fn sanitize_preview(body: Bytes) -> Result<Json<Value>, ApiError> {
    let req: SanitizeRequest = parse_json(&body)?;
    match (req.html, req.fields) {
        (Some(html), None) => Ok(Json(json!({ "html": sanitize_html(&html) }))),
        (None, Some(mut fields)) => {
            sanitize_form(&mut fields);
            Ok(Json(json!({ "fields": fields })))
        }
        _ => Err(ApiError::bad_request("send exactly one of `html` or `fields`")),
    }
}
