//! Application State
//!
//! Arc-wrapped context shared by every handler. It replaces process-wide
//! globals: sessions, the CSP nonce and the rate limiter all hang off it and
//! live exactly as long as the server.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::crypto::TokenCipher;
use crate::db::Pool;
use crate::integrations::{
    fred::FredClient, http_client, instagram::InstagramClient, linkedin::LinkedInClient,
    SocialPublisher,
};
use crate::security::csp::{CspNonceManager, CspPolicy};
use crate::security::rate_limit::{RateLimitStore, RateLimiter};
use crate::session::{SessionRegistry, SessionTimeoutConfig};
use crate::tokens;

pub type SharedLimiter = RateLimiter<Box<dyn RateLimitStore>>;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    pool: Pool,
    config: Config,
    sessions: SessionRegistry,
    csp: CspNonceManager,
    limiter: SharedLimiter,
    cipher: TokenCipher,
    http: reqwest::Client,
    fred: FredClient,
    linkedin: LinkedInClient,
    instagram: InstagramClient,
}

impl AppState {
    /// Build the shared state. Integration tokens left in clear text are
    /// sealed first, then each client takes its token from the encrypted
    /// table and falls back to the config value.
    pub async fn new(pool: Pool, config: Config, store: Box<dyn RateLimitStore>) -> Result<Self> {
        let http = http_client()?;
        let cipher = TokenCipher::new(&config.token_key_bytes()?)?;
        let sealed = tokens::migrate_plaintext_tokens(&pool, &cipher).await?;
        if sealed > 0 {
            info!(sealed, "encrypted clear-text integration tokens");
        }
        let integrations = &config.integrations;
        let linkedin_token =
            tokens::resolve_token(&pool, &cipher, "linkedin", &integrations.linkedin.access_token)
                .await?;
        let instagram_token = tokens::resolve_token(
            &pool,
            &cipher,
            "instagram",
            &integrations.instagram.access_token,
        )
        .await?;
        let fred = FredClient::new(
            http.clone(),
            integrations.fred.api_key.clone(),
            &integrations.fred.base_url,
        )?;
        let linkedin = LinkedInClient::new(
            http.clone(),
            linkedin_token,
            integrations.linkedin.author_urn.clone(),
            &integrations.linkedin.base_url,
        )?;
        let instagram = InstagramClient::new(
            http.clone(),
            instagram_token,
            integrations.instagram.account_id.clone(),
            &integrations.instagram.base_url,
        )?;
        let sessions = SessionRegistry::new(SessionTimeoutConfig::from_minutes(
            config.session.timeout_minutes,
            config.session.warning_minutes,
        ));
        let csp = CspNonceManager::new(CspPolicy::new(config.security.csp.clone()));

        Ok(Self {
            inner: Arc::new(InnerState {
                pool,
                config,
                sessions,
                csp,
                limiter: RateLimiter::new(store),
                cipher,
                http,
                fred,
                linkedin,
                instagram,
            }),
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn csp(&self) -> &CspNonceManager {
        &self.inner.csp
    }

    pub fn limiter(&self) -> &SharedLimiter {
        &self.inner.limiter
    }

    pub fn cipher(&self) -> &TokenCipher {
        &self.inner.cipher
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub fn fred(&self) -> &FredClient {
        &self.inner.fred
    }

    pub fn linkedin(&self) -> &LinkedInClient {
        &self.inner.linkedin
    }

    /// Publishers handed to the outbox worker.
    pub fn publishers(&self) -> Vec<Arc<dyn SocialPublisher>> {
        vec![
            Arc::new(self.inner.linkedin.clone()),
            Arc::new(self.inner.instagram.clone()),
        ]
    }
}
