//! Cookie-consent tracking keyed by hashed client IP.

use anyhow::Result;
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::model::{ConsentChoices, CookieConsent};

/// Version stamped on records when the client does not send one.
pub const CURRENT_CONSENT_VERSION: &str = "1.0";

/// Store the visitor's choices. Necessary cookies cannot be declined.
#[instrument(skip_all)]
pub async fn record(
    pool: &Pool,
    ip_hash: &str,
    mut choices: ConsentChoices,
    version: Option<&str>,
) -> Result<CookieConsent> {
    choices.necessary = true;
    let version = version
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(CURRENT_CONSENT_VERSION);
    db::upsert_consent(pool, ip_hash, &choices, version).await?;
    info!(analytics = choices.analytics, marketing = choices.marketing, "consent recorded");
    lookup(pool, ip_hash)
        .await?
        .ok_or_else(|| anyhow::anyhow!("consent row missing after upsert"))
}

pub async fn lookup(pool: &Pool, ip_hash: &str) -> Result<Option<CookieConsent>> {
    db::consent_for(pool, ip_hash).await
}
