//! Encryption migration for stored integration tokens.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::crypto::TokenCipher;
use crate::db::{self, Pool};

/// Seal every token still stored in clear text and clear the clear-text
/// column. Running it again finds nothing left to do.
#[instrument(skip_all)]
pub async fn migrate_plaintext_tokens(pool: &Pool, cipher: &TokenCipher) -> Result<usize> {
    let pending = db::plaintext_integration_tokens(pool).await?;
    for token in &pending {
        let sealed = cipher
            .seal(&token.token)
            .with_context(|| format!("failed to encrypt token for {}", token.provider))?;
        db::store_encrypted_token(pool, token.id, &sealed).await?;
        info!(provider = %token.provider, "integration token encrypted");
    }
    Ok(pending.len())
}

/// Decrypt the stored token for `provider`, if any.
pub async fn load_token(pool: &Pool, cipher: &TokenCipher, provider: &str) -> Result<Option<String>> {
    match db::encrypted_integration_token(pool, provider).await? {
        Some(sealed) => Ok(Some(
            cipher
                .open(&sealed)
                .with_context(|| format!("failed to decrypt token for {provider}"))?,
        )),
        None => Ok(None),
    }
}

/// Token for `provider` from the encrypted table, or `fallback` (the config
/// value) when none is stored.
pub async fn resolve_token(
    pool: &Pool,
    cipher: &TokenCipher,
    provider: &str,
    fallback: &str,
) -> Result<String> {
    match load_token(pool, cipher, provider).await? {
        Some(token) => {
            debug!(provider, "using stored integration token");
            Ok(token)
        }
        None => Ok(fallback.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migration_is_idempotent() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let cipher = TokenCipher::new(&[7u8; 32]).unwrap();

        db::upsert_plaintext_token(&pool, "linkedin", "li-secret").await.unwrap();
        db::upsert_plaintext_token(&pool, "instagram", "ig-secret").await.unwrap();

        assert_eq!(migrate_plaintext_tokens(&pool, &cipher).await.unwrap(), 2);
        assert_eq!(migrate_plaintext_tokens(&pool, &cipher).await.unwrap(), 0);
        assert!(db::plaintext_integration_tokens(&pool).await.unwrap().is_empty());

        assert_eq!(
            load_token(&pool, &cipher, "linkedin").await.unwrap().as_deref(),
            Some("li-secret")
        );
        assert_eq!(load_token(&pool, &cipher, "calendly").await.unwrap(), None);

        assert_eq!(
            resolve_token(&pool, &cipher, "instagram", "from-config").await.unwrap(),
            "ig-secret"
        );
        assert_eq!(
            resolve_token(&pool, &cipher, "calendly", "from-config").await.unwrap(),
            "from-config"
        );

        let wrong = TokenCipher::new(&[8u8; 32]).unwrap();
        assert!(load_token(&pool, &wrong, "instagram").await.is_err());
    }
}
