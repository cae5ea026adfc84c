//! Configuration loader and validator for the edge service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::security::rate_limit::RateLimitRule;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub site: Site,
    pub session: Session,
    pub security: Security,
    pub integrations: Integrations,
    #[serde(default)]
    pub health: Health,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Public site metadata used by the feeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub name: String,
    pub base_url: String,
    pub description: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub static_pages: Vec<StaticPage>,
    /// Built single-page-app shell served at `/` with CSP nonces applied.
    #[serde(default)]
    pub shell_path: Option<String>,
}

/// A hand-maintained page listed in the sitemap and feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticPage {
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_changefreq")]
    pub changefreq: String,
    #[serde(default = "default_priority")]
    pub priority: f32,
}

/// Inactivity sign-out settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub timeout_minutes: u64,
    pub warning_minutes: u64,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Security {
    #[serde(default)]
    pub ip_hash_salt: String,
    /// 32-byte AES key, hex encoded.
    pub token_encryption_key: String,
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    #[serde(default)]
    pub csp: CspSources,
    pub rate_limits: RateLimits,
}

/// Allow-lists for the CSP fetch directives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CspSources {
    #[serde(default)]
    pub img_src: Vec<String>,
    #[serde(default)]
    pub font_src: Vec<String>,
    #[serde(default)]
    pub connect_src: Vec<String>,
    #[serde(default)]
    pub frame_src: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimits {
    pub analytics: RateLimitRule,
    pub consent: RateLimitRule,
    pub admin_search: RateLimitRule,
    pub csp_report: RateLimitRule,
}

impl RateLimits {
    /// Widest window across every rule; attempts older than this are dead.
    pub fn longest_window_ms(&self) -> u64 {
        [self.analytics, self.consent, self.admin_search, self.csp_report]
            .iter()
            .map(|rule| rule.window_ms)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Integrations {
    pub fred: Fred,
    pub linkedin: LinkedIn,
    pub instagram: Instagram,
    #[serde(default)]
    pub calendly: Calendly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fred {
    pub api_key: String,
    #[serde(default = "default_fred_base")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkedIn {
    pub access_token: String,
    /// Organization or member URN posts are published as.
    pub author_urn: String,
    /// Client secret used to check `X-LI-Signature` on webhook deliveries.
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_linkedin_base")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instagram {
    pub access_token: String,
    pub account_id: String,
    pub verify_token: String,
    /// App secret used to check `X-Hub-Signature-256` on webhook deliveries.
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default = "default_instagram_base")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Calendly {
    #[serde(default)]
    pub scheduling_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Health {
    /// Optional URL probed for outbound connectivity.
    #[serde(default)]
    pub probe_url: Option<String>,
}

fn default_language() -> String {
    "en-us".into()
}

fn default_changefreq() -> String {
    "monthly".into()
}

fn default_priority() -> f32 {
    0.5
}

fn default_token_ttl_hours() -> u64 {
    12
}

fn default_fred_base() -> String {
    "https://api.stlouisfed.org/".into()
}

fn default_linkedin_base() -> String {
    "https://api.linkedin.com/".into()
}

fn default_instagram_base() -> String {
    "https://graph.facebook.com/v19.0/".into()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins; otherwise a file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/counsel.db", self.app.data_dir))
    }

    pub fn token_key_bytes(&self) -> Result<[u8; 32], ConfigError> {
        let raw = hex::decode(self.security.token_encryption_key.trim()).map_err(|_| {
            ConfigError::Invalid("security.token_encryption_key must be hex")
        })?;
        raw.try_into().map_err(|_| {
            ConfigError::Invalid("security.token_encryption_key must be 32 bytes (64 hex chars)")
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    let base = cfg.site.base_url.trim();
    if !(base.starts_with("https://") || base.starts_with("http://")) {
        return Err(ConfigError::Invalid("site.base_url must be an http(s) URL"));
    }
    if cfg.site.name.trim().is_empty() {
        return Err(ConfigError::Invalid("site.name must be non-empty"));
    }
    for page in &cfg.site.static_pages {
        if !page.path.starts_with('/') {
            return Err(ConfigError::Invalid("site.static_pages[].path must start with '/'"));
        }
        if !(0.0..=1.0).contains(&page.priority) {
            return Err(ConfigError::Invalid("site.static_pages[].priority must be within 0.0..=1.0"));
        }
    }

    if cfg.session.timeout_minutes == 0 {
        return Err(ConfigError::Invalid("session.timeout_minutes must be > 0"));
    }
    if cfg.session.warning_minutes >= cfg.session.timeout_minutes {
        return Err(ConfigError::Invalid(
            "session.warning_minutes must be smaller than session.timeout_minutes",
        ));
    }

    cfg.token_key_bytes()?;

    let limits = &cfg.security.rate_limits;
    for rule in [&limits.analytics, &limits.consent, &limits.admin_search, &limits.csp_report] {
        if rule.max_attempts == 0 || rule.window_ms == 0 {
            return Err(ConfigError::Invalid(
                "security.rate_limits entries need max_attempts > 0 and window_ms > 0",
            ));
        }
    }

    if cfg.integrations.instagram.verify_token.trim().is_empty() {
        return Err(ConfigError::Invalid("integrations.instagram.verify_token must be non-empty"));
    }

    Ok(())
}

/// Returns a complete example YAML document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "0.0.0.0:8080"
  poll_interval_ms: 1000
  max_backoff_seconds: 600

site:
  name: "Meridian Geopolitical Advisory"
  base_url: "https://www.example.com"
  description: "Geopolitical risk analysis and strategic advisory."
  static_pages:
    - path: "/"
      title: "Home"
      changefreq: "weekly"
      priority: 1.0
    - path: "/services"
      title: "Services"
      priority: 0.8
    - path: "/about"
      title: "About"
    - path: "/contact"
      title: "Contact"
      changefreq: "yearly"
      priority: 0.6

session:
  timeout_minutes: 60
  warning_minutes: 5
  token_ttl_hours: 12

security:
  ip_hash_salt: "change-me"
  token_encryption_key: "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
  cors_allowed_origins:
    - "https://www.example.com"
  csp:
    img_src: ["https://media.licdn.com", "https://*.cdninstagram.com"]
    font_src: ["https://fonts.gstatic.com"]
    connect_src: ["https://api.stlouisfed.org", "https://calendly.com"]
    frame_src: ["https://calendly.com", "https://www.linkedin.com"]
  rate_limits:
    analytics: { max_attempts: 60, window_ms: 60000 }
    consent: { max_attempts: 10, window_ms: 60000 }
    admin_search: { max_attempts: 5, window_ms: 60000 }
    csp_report: { max_attempts: 30, window_ms: 60000 }

integrations:
  fred:
    api_key: "YOUR_FRED_API_KEY"
  linkedin:
    access_token: "YOUR_LINKEDIN_ACCESS_TOKEN"
    author_urn: "urn:li:organization:0000000"
    client_secret: "YOUR_LINKEDIN_CLIENT_SECRET"
  instagram:
    access_token: "YOUR_INSTAGRAM_ACCESS_TOKEN"
    account_id: "17841400000000000"
    verify_token: "YOUR_WEBHOOK_VERIFY_TOKEN"
    app_secret: "YOUR_META_APP_SECRET"
  calendly:
    scheduling_url: "https://calendly.com/example/consultation"

health:
  probe_url: null
"#
}
