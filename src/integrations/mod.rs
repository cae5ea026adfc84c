//! Outbound third-party integrations.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Response, StatusCode};
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;

use crate::crypto::constant_time_eq;
use crate::model::{SocialPlatform, SocialPost};

pub mod calendly;
pub mod fred;
pub mod instagram;
pub mod linkedin;

type HmacSha256 = Hmac<Sha256>;

const USER_AGENT: &str = concat!("counsel-edge/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Publishes a scheduled post to one social platform.
#[async_trait]
pub trait SocialPublisher: Send + Sync {
    fn platform(&self) -> SocialPlatform;

    /// Publish and return the platform's id for the new post.
    async fn publish(&self, post: &SocialPost) -> Result<String>;
}

/// HTTP client shared by the integration clients.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

/// Fail on non-2xx responses, keeping the status and body for the log.
pub(crate) async fn ensure_success(res: Response, service: &str) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!(service, "rate limited by upstream");
        return Err(anyhow!("received 429 from {service}: {body}"));
    }
    warn!(service, %status, "upstream error");
    Err(anyhow!("{service} error {status}: {body}"))
}

/// Check a `sha256=<hex>` webhook signature computed over the raw body.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let provided = header.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    constant_time_eq(&expected, &provided)
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
