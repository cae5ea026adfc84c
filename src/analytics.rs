//! Visitor analytics ingestion.
//!
//! Nothing is stored for a visitor without an analytics consent record. The
//! client IP never reaches the database; only its salted SHA-256 does.

use anyhow::Result;
use reqwest::Url;
use tracing::{debug, instrument};

use crate::crypto::sha256_hex;
use crate::db::{self, Pool};
use crate::error::ApiError;
use crate::model::{VisitRecord, VisitorEvent};

const MAX_PATH_LEN: usize = 512;
const MAX_USER_AGENT_LEN: usize = 512;

pub fn hash_ip(salt: &str, ip: &str) -> String {
    sha256_hex(format!("{salt}{}", ip.trim()))
}

/// First two letters, upper-cased. Anything else is dropped.
pub fn normalize_country(raw: Option<&str>) -> Option<String> {
    let code: String = raw?.trim().chars().take(2).collect();
    (code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()))
        .then(|| code.to_ascii_uppercase())
}

/// Hostname of the referrer URL, without scheme, path or query.
pub fn referrer_host(raw: Option<&str>) -> Option<String> {
    let url = Url::parse(raw?.trim()).ok()?;
    url.host_str().map(|h| h.to_ascii_lowercase())
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

pub fn normalize(ip_hash: String, event: &VisitorEvent) -> Result<VisitRecord, ApiError> {
    let page_path = event.page_path.trim();
    if page_path.is_empty() || !page_path.starts_with('/') {
        return Err(ApiError::bad_request("pagePath must be an absolute path"));
    }
    Ok(VisitRecord {
        ip_hash,
        page_path: truncate(page_path, MAX_PATH_LEN),
        referrer_host: referrer_host(event.referrer.as_deref()),
        user_agent: event
            .user_agent
            .as_deref()
            .map(|ua| truncate(ua.trim(), MAX_USER_AGENT_LEN))
            .filter(|ua| !ua.is_empty()),
        session_id: event.session_id.clone().filter(|s| !s.trim().is_empty()),
        country: normalize_country(event.country.as_deref()),
    })
}

/// Store a page view after the consent check.
#[instrument(skip_all)]
pub async fn ingest(pool: &Pool, ip_hash: &str, event: &VisitorEvent) -> Result<i64, ApiError> {
    let consent = db::consent_for(pool, ip_hash).await?;
    if !consent.map(|c| c.choices.analytics).unwrap_or(false) {
        debug!("analytics event dropped without consent");
        return Err(ApiError::ConsentRequired);
    }
    let record = normalize(ip_hash.to_string(), event)?;
    Ok(db::insert_visit(pool, &record).await?)
}
