//! Sitemap and RSS handlers

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;

use crate::error::ApiError;
use crate::feeds::{load_index, render_rss, render_sitemap};
use crate::state::AppState;

const FEED_CACHE: &str = "public, max-age=3600";

pub async fn sitemap(State(state): State<AppState>) -> Result<Response, ApiError> {
    let site = &state.config().site;
    let index = load_index(state.pool(), site).await?;
    let xml = render_sitemap(&site.base_url, &index, Utc::now().date_naive());
    Ok((
        [
            (header::CONTENT_TYPE, "application/xml; charset=utf-8"),
            (header::CACHE_CONTROL, FEED_CACHE),
        ],
        xml,
    )
        .into_response())
}

pub async fn rss(State(state): State<AppState>) -> Result<Response, ApiError> {
    let site = &state.config().site;
    let index = load_index(state.pool(), site).await?;
    let xml = render_rss(site, &index, Utc::now());
    Ok((
        [
            (header::CONTENT_TYPE, "application/rss+xml; charset=utf-8"),
            (header::CACHE_CONTROL, FEED_CACHE),
        ],
        xml,
    )
        .into_response())
}
