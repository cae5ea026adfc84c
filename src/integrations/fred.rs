//! FRED (Federal Reserve Economic Data) observations proxy.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument};

use super::ensure_success;

pub const DEFAULT_LIMIT: u32 = 24;
pub const MAX_LIMIT: u32 = 500;

static SERIES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9_]{1,32}$").expect("valid series regex"));

/// Normalise a series id (`gdp` -> `GDP`). `None` when it is not a plausible
/// FRED identifier.
pub fn normalize_series_id(raw: &str) -> Option<String> {
    let id = raw.trim().to_ascii_uppercase();
    SERIES_RE.is_match(&id).then_some(id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub date: NaiveDate,
    /// `None` where FRED reports a missing value (`.`).
    pub value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ObservationsResponse {
    #[serde(default)]
    observations: Vec<RawObservation>,
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    date: String,
    value: String,
}

#[derive(Clone)]
pub struct FredClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for FredClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FredClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl FredClient {
    pub fn new(http: Client, api_key: String, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid FRED base URL")?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn build_request(&self, series_id: &str, limit: u32) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("fred/series/observations")
            .context("invalid FRED base URL")?;
        self.http
            .get(endpoint)
            .query(&[
                ("series_id", series_id),
                ("api_key", self.api_key.as_str()),
                ("file_type", "json"),
                ("sort_order", "desc"),
                ("limit", &limit.clamp(1, MAX_LIMIT).to_string()),
            ])
            .build()
            .context("failed to build FRED request")
    }

    /// Latest observations, newest first.
    #[instrument(skip(self))]
    pub async fn observations(&self, series_id: &str, limit: u32) -> Result<Vec<Observation>> {
        let request = self.build_request(series_id, limit)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach FRED")?;
        let body = ensure_success(res, "FRED")
            .await?
            .text()
            .await
            .context("failed to read FRED response")?;
        let observations = parse_observations(&body)?;
        debug!(count = observations.len(), "fetched FRED observations");
        Ok(observations)
    }
}

pub fn parse_observations(body: &str) -> Result<Vec<Observation>> {
    let parsed: ObservationsResponse =
        serde_json::from_str(body).context("invalid FRED response JSON")?;
    parsed
        .observations
        .into_iter()
        .map(|raw| {
            let date = NaiveDate::parse_from_str(&raw.date, "%Y-%m-%d")
                .with_context(|| format!("invalid observation date {}", raw.date))?;
            Ok(Observation {
                date,
                value: raw.value.trim().parse::<f64>().ok(),
            })
        })
        .collect()
}
