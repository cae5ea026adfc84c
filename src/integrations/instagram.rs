//! Instagram Graph API publishing and webhook handling.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{info, instrument};

use super::{ensure_success, SocialPublisher};
use crate::crypto::constant_time_eq;
use crate::model::{SocialPlatform, SocialPost};

pub const MAX_CAPTION_CHARS: usize = 2200;

#[derive(Clone)]
pub struct InstagramClient {
    http: Client,
    base_url: Url,
    token: String,
    account_id: String,
}

impl fmt::Debug for InstagramClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstagramClient")
            .field("base_url", &self.base_url)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

impl InstagramClient {
    pub fn new(http: Client, token: String, account_id: String, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid Instagram base URL")?;
        Ok(Self {
            http,
            base_url,
            token,
            account_id,
        })
    }

    /// Step one: create a media container for the image.
    pub fn build_container_request(&self, caption: &str, image_url: &str) -> Result<reqwest::Request> {
        if caption.chars().count() > MAX_CAPTION_CHARS {
            return Err(anyhow!("Instagram caption exceeds {MAX_CAPTION_CHARS} characters"));
        }
        let endpoint = self
            .base_url
            .join(&format!("{}/media", self.account_id))
            .context("invalid Instagram base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.token)
            .form(&[("image_url", image_url), ("caption", caption)])
            .build()
            .context("failed to build Instagram media request")
    }

    /// Step two: publish a finished container.
    pub fn build_publish_request(&self, creation_id: &str) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("{}/media_publish", self.account_id))
            .context("invalid Instagram base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.token)
            .form(&[("creation_id", creation_id)])
            .build()
            .context("failed to build Instagram publish request")
    }

    async fn execute_for_id(&self, request: reqwest::Request) -> Result<String> {
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Instagram")?;
        let payload: IdResponse = ensure_success(res, "Instagram")
            .await?
            .json()
            .await
            .context("invalid Instagram response JSON")?;
        Ok(payload.id)
    }

    /// Publish an image post; returns the media id.
    #[instrument(skip_all)]
    pub async fn publish_image(&self, caption: &str, image_url: &str) -> Result<String> {
        let creation_id = self
            .execute_for_id(self.build_container_request(caption, image_url)?)
            .await?;
        let media_id = self
            .execute_for_id(self.build_publish_request(&creation_id)?)
            .await?;
        info!(media_id, "published Instagram media");
        Ok(media_id)
    }
}

#[async_trait]
impl SocialPublisher for InstagramClient {
    fn platform(&self) -> SocialPlatform {
        SocialPlatform::Instagram
    }

    async fn publish(&self, post: &SocialPost) -> Result<String> {
        let image_url = post
            .image_url
            .as_deref()
            .ok_or_else(|| anyhow!("Instagram posts need an image"))?;
        self.publish_image(&post.content, image_url).await
    }
}

/// Answer to the `GET` subscription handshake: the challenge to echo back
/// when the mode and verify token match.
pub fn verify_subscription<'a>(
    params: &'a HashMap<String, String>,
    expected_token: &str,
) -> Option<&'a str> {
    let mode = params.get("hub.mode")?;
    let token = params.get("hub.verify_token")?;
    let challenge = params.get("hub.challenge")?;
    (mode == "subscribe" && constant_time_eq(token.as_bytes(), expected_token.as_bytes()))
        .then_some(challenge.as_str())
}

/// Media change reported by a webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaChange {
    pub media_id: String,
    pub caption: String,
    pub media_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    field: String,
    #[serde(default)]
    value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    media_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    media_url: Option<String>,
}

/// Extract media changes; other fields (comments, mentions) are ignored.
pub fn parse_webhook(body: &[u8]) -> Result<Vec<MediaChange>> {
    let payload: WebhookPayload =
        serde_json::from_slice(body).context("invalid Instagram webhook JSON")?;
    let mut out = Vec::new();
    for entry in payload.entry {
        let timestamp = entry
            .time
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
            .unwrap_or_else(Utc::now);
        for change in entry.changes {
            if change.field != "media" {
                continue;
            }
            let Some(media_id) = change.value.media_id.or(change.value.id) else {
                continue;
            };
            out.push(MediaChange {
                media_id,
                caption: change.value.caption.unwrap_or_default(),
                media_url: change.value.media_url,
                timestamp,
            });
        }
    }
    Ok(out)
}
