//! LinkedIn company-page publishing and webhook ingestion.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::{info, instrument};

use super::{ensure_success, SocialPublisher};
use crate::model::{LinkedInPost, SocialPlatform, SocialPost};

/// LinkedIn rejects commentary longer than this.
pub const MAX_COMMENTARY_CHARS: usize = 3000;

#[derive(Clone)]
pub struct LinkedInClient {
    http: Client,
    base_url: Url,
    token: String,
    author_urn: String,
}

impl fmt::Debug for LinkedInClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedInClient")
            .field("base_url", &self.base_url)
            .field("author_urn", &self.author_urn)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: Option<String>,
}

impl LinkedInClient {
    pub fn new(http: Client, token: String, author_urn: String, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid LinkedIn base URL")?;
        Ok(Self {
            http,
            base_url,
            token,
            author_urn,
        })
    }

    pub fn build_publish_request(&self, text: &str) -> Result<reqwest::Request> {
        if text.trim().is_empty() {
            return Err(anyhow!("LinkedIn post text is empty"));
        }
        if text.chars().count() > MAX_COMMENTARY_CHARS {
            return Err(anyhow!("LinkedIn post exceeds {MAX_COMMENTARY_CHARS} characters"));
        }
        let endpoint = self
            .base_url
            .join("v2/ugcPosts")
            .context("invalid LinkedIn base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.token)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&ugc_post_body(&self.author_urn, text))
            .build()
            .context("failed to build LinkedIn request")
    }

    /// Publish a text post; returns the created post URN.
    #[instrument(skip_all)]
    pub async fn publish_text(&self, text: &str) -> Result<String> {
        let request = self.build_publish_request(text)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach LinkedIn")?;
        let res = ensure_success(res, "LinkedIn").await?;
        let header_id = res
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: CreatedResponse = res.json().await.unwrap_or(CreatedResponse { id: None });
        let id = header_id
            .or(body.id)
            .ok_or_else(|| anyhow!("LinkedIn response carried no post id"))?;
        info!(id, "published LinkedIn post");
        Ok(id)
    }
}

fn ugc_post_body(author: &str, text: &str) -> Value {
    json!({
        "author": author,
        "lifecycleState": "PUBLISHED",
        "specificContent": {
            "com.linkedin.ugc.ShareContent": {
                "shareCommentary": { "text": text },
                "shareMediaCategory": "NONE"
            }
        },
        "visibility": { "com.linkedin.ugc.MemberNetworkVisibility": "PUBLIC" }
    })
}

#[async_trait]
impl SocialPublisher for LinkedInClient {
    fn platform(&self) -> SocialPlatform {
        SocialPlatform::LinkedIn
    }

    async fn publish(&self, post: &SocialPost) -> Result<String> {
        let text = match post.image_url.as_deref() {
            Some(url) => format!("{}\n\n{}", post.content, url),
            None => post.content.clone(),
        };
        self.publish_text(&text).await
    }
}

/// Webhook delivery: a batch of posts or articles published on the page.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub elements: Vec<WebhookElement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookElement {
    pub id: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub published_at: Option<i64>,
}

/// Map a webhook delivery onto `linkedin_posts` rows. Elements without an id
/// or any text are skipped.
pub fn parse_webhook(body: &[u8]) -> Result<Vec<LinkedInPost>> {
    let payload: WebhookPayload =
        serde_json::from_slice(body).context("invalid LinkedIn webhook JSON")?;
    Ok(payload
        .elements
        .into_iter()
        .filter_map(|el| {
            let id = el.id.trim().to_string();
            let text = el.text.or(el.title).unwrap_or_default().trim().to_string();
            if id.is_empty() || text.is_empty() {
                return None;
            }
            let kind = match el.kind.as_deref() {
                Some("article") => "article",
                _ => "post",
            };
            Some(LinkedInPost {
                external_id: id,
                kind: kind.to_string(),
                text,
                url: el.url,
                posted_on: el.published_at.and_then(millis_to_date),
            })
        })
        .collect())
}

fn millis_to_date(ms: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> LinkedInClient {
        LinkedInClient::new(
            Client::new(),
            "tok".into(),
            "urn:li:organization:42".into(),
            "https://li.test/",
        )
        .unwrap()
    }

    #[test]
    fn publish_request_shape() {
        let req = client().build_publish_request("Hello").unwrap();
        assert_eq!(req.url().as_str(), "https://li.test/v2/ugcPosts");
        assert_eq!(req.headers()["authorization"], "Bearer tok");
        assert_eq!(req.headers()["x-restli-protocol-version"], "2.0.0");
        let body: Value = serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["author"], "urn:li:organization:42");
        assert_eq!(
            body["specificContent"]["com.linkedin.ugc.ShareContent"]["shareCommentary"]["text"],
            "Hello"
        );
    }

    #[test]
    fn oversized_or_empty_text_is_rejected() {
        assert!(client().build_publish_request("  ").is_err());
        assert!(client()
            .build_publish_request(&"x".repeat(MAX_COMMENTARY_CHARS + 1))
            .is_err());
    }

    #[test]
    fn webhook_elements_become_rows() {
        let body = br#"{"elements":[
            {"id":"urn:li:share:1","text":"Outlook 2025","publishedAt":1717243200000},
            {"id":"urn:li:article:2","kind":"article","title":"Energy security","url":"https://lnkd.in/x"},
            {"id":"","text":"dropped"},
            {"id":"urn:li:share:3"}
        ]}"#;
        let rows = parse_webhook(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "post");
        assert_eq!(rows[0].posted_on, NaiveDate::from_ymd_opt(2024, 6, 1));
        assert_eq!(rows[1].kind, "article");
        assert_eq!(rows[1].text, "Energy security");
    }
}
