//! Row models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::OutboxKind;

/// Stored bearer token, looked up by hash.
#[derive(Debug, Clone)]
pub struct AccessTokenRow {
    pub id: i64,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AccessTokenRow {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// Due outbox task picked by the worker.
#[derive(Debug, Clone)]
pub struct OutboxTask {
    pub id: i64,
    pub kind: OutboxKind,
    pub ref_id: i64,
    pub attempt: i32,
}

/// Integration token still stored in clear text.
#[derive(Debug, Clone)]
pub struct PlaintextToken {
    pub id: i64,
    pub provider: String,
    pub token: String,
}

/// Result of the database-side health function.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseHealth {
    pub ok: bool,
    pub latency_ms: u64,
    pub published_articles: i64,
    pub pending_outbox: i64,
}
