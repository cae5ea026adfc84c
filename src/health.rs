//! Health check: database-side health function plus an optional outbound
//! connectivity probe.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

use crate::db::{self, DatabaseHealth, Pool};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub url: String,
    pub ok: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub database: Option<DatabaseHealth>,
    pub probe: Option<ProbeResult>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Database down is unhealthy; a failing probe alone is degraded.
#[instrument(skip_all)]
pub async fn check(pool: &Pool, http: &Client, probe_url: Option<&str>) -> HealthReport {
    let database = match db::database_health(pool).await {
        Ok(health) => Some(health),
        Err(err) => {
            warn!(?err, "database health check failed");
            None
        }
    };
    let probe = match probe_url {
        Some(url) => Some(probe(http, url).await),
        None => None,
    };

    let status = match (&database, &probe) {
        (None, _) => HealthStatus::Unhealthy,
        (Some(db), _) if !db.ok => HealthStatus::Unhealthy,
        (Some(_), Some(p)) if !p.ok => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    };

    HealthReport {
        status,
        database,
        probe,
        checked_at: Utc::now(),
    }
}

async fn probe(http: &Client, url: &str) -> ProbeResult {
    let started = Instant::now();
    let res = http.head(url).timeout(PROBE_TIMEOUT).send().await;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match res {
        Ok(resp) => ProbeResult {
            url: url.to_string(),
            ok: resp.status().is_success() || resp.status().is_redirection(),
            status_code: Some(resp.status().as_u16()),
            latency_ms,
        },
        Err(err) => {
            warn!(?err, url, "connectivity probe failed");
            ProbeResult {
                url: url.to_string(),
                ok: false,
                status_code: None,
                latency_ms,
            }
        }
    }
}
