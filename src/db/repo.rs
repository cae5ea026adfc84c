use super::model::{AccessTokenRow, DatabaseHealth, OutboxTask, PlaintextToken};
use crate::crypto::Sealed;
use crate::model::{
    Article, ArticleDraft, ArticleStatus, AuditEvent, ConsentChoices, CookieConsent,
    LinkedInPost, OutboxKind, Partner, PostStatus, SocialPlatform, SocialPost, UserRole,
    UserSummary, VisitRecord, WebsiteContent,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use std::time::Instant;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask sqlite to create the file. Leaves in-memory URLs
/// untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Users, roles and access tokens
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_user(pool: &Pool, email: &str, display_name: Option<&str>) -> Result<i64> {
    let email = email.trim().to_lowercase();
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query("INSERT INTO users (email, display_name) VALUES (?, ?) RETURNING id")
        .bind(&email)
        .bind(display_name)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn grant_role(pool: &Pool, user_id: i64, role: UserRole) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO user_roles (user_id, role) VALUES (?, ?)")
        .bind(user_id)
        .bind(role.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn user_has_role(pool: &Pool, user_id: i64, role: UserRole) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM user_roles WHERE user_id = ? AND role = ?")
            .bind(user_id)
            .bind(role.as_str())
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

/// Users whose email contains `needle` (case-insensitive), newest first.
#[instrument(skip_all)]
pub async fn search_users(pool: &Pool, needle: &str, limit: i64) -> Result<Vec<UserSummary>> {
    let pattern = format!("%{}%", escape_like(&needle.trim().to_lowercase()));
    let rows = sqlx::query(
        "SELECT u.id, u.email, u.created_at, GROUP_CONCAT(r.role) AS roles \
         FROM users u LEFT JOIN user_roles r ON r.user_id = u.id \
         WHERE u.email LIKE ? ESCAPE '\\' \
         GROUP BY u.id ORDER BY datetime(u.created_at) DESC, u.id DESC LIMIT ?",
    )
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let roles: Option<String> = row.try_get("roles")?;
            let mut roles: Vec<String> = roles
                .unwrap_or_default()
                .split(',')
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            roles.sort();
            Ok(UserSummary {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                roles,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[instrument(skip_all)]
pub async fn insert_access_token(
    pool: &Pool,
    user_id: i64,
    token_hash: &str,
    expires_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO access_tokens (user_id, token_hash, expires_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(user_id)
    .bind(token_hash)
    .bind(expires_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn find_access_token(pool: &Pool, token_hash: &str) -> Result<Option<AccessTokenRow>> {
    let row = sqlx::query(
        "SELECT id, user_id, expires_at, revoked_at FROM access_tokens WHERE token_hash = ?",
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    row.map(|row| {
        Ok(AccessTokenRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            expires_at: row.try_get("expires_at")?,
            revoked_at: row.try_get("revoked_at")?,
        })
    })
    .transpose()
}

#[instrument(skip_all)]
pub async fn revoke_access_token(pool: &Pool, token_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE access_tokens SET revoked_at = CURRENT_TIMESTAMP WHERE id = ? AND revoked_at IS NULL",
    )
    .bind(token_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Articles, partners and website content
// ---------------------------------------------------------------------------

const ARTICLE_COLUMNS: &str =
    "id, slug, title, excerpt, content, category, author, status, published_at, updated_at";

fn map_article(row: &SqliteRow) -> Result<Article> {
    let status: String = row.try_get("status")?;
    Ok(Article {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        title: row.try_get("title")?,
        excerpt: row.try_get("excerpt")?,
        content: row.try_get("content")?,
        category: row.try_get("category")?,
        author: row.try_get("author")?,
        status: ArticleStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("unknown article status {status}"))?,
        published_at: row.try_get("published_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert an article. `published_at` is stamped when it is created published.
#[instrument(skip_all)]
pub async fn insert_article(pool: &Pool, draft: &ArticleDraft, created_by: Option<i64>) -> Result<i64> {
    let published_at = (draft.status == ArticleStatus::Published).then(Utc::now);
    let rec = sqlx::query(
        "INSERT INTO articles (slug, title, excerpt, content, category, author, status, created_by, published_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&draft.slug)
    .bind(&draft.title)
    .bind(&draft.excerpt)
    .bind(&draft.content)
    .bind(&draft.category)
    .bind(&draft.author)
    .bind(draft.status.as_str())
    .bind(created_by)
    .bind(published_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Replace an article's fields. The first transition to published stamps
/// `published_at`; later edits keep the original date.
#[instrument(skip_all)]
pub async fn update_article(pool: &Pool, id: i64, draft: &ArticleDraft) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE articles SET slug = ?, title = ?, excerpt = ?, content = ?, category = ?, author = ?, status = ?, \
         published_at = CASE WHEN ? = 'published' THEN COALESCE(published_at, ?) ELSE published_at END, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(&draft.slug)
    .bind(&draft.title)
    .bind(&draft.excerpt)
    .bind(&draft.content)
    .bind(&draft.category)
    .bind(&draft.author)
    .bind(draft.status.as_str())
    .bind(draft.status.as_str())
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn published_articles(pool: &Pool, limit: i64) -> Result<Vec<Article>> {
    let sql = format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles WHERE status = 'published' \
         ORDER BY datetime(published_at) DESC, id DESC LIMIT ?"
    );
    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;
    rows.iter().map(map_article).collect()
}

#[instrument(skip_all)]
pub async fn article_by_slug(pool: &Pool, slug: &str) -> Result<Option<Article>> {
    let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE slug = ? AND status = 'published'");
    let row = sqlx::query(&sql).bind(slug).fetch_optional(pool).await?;
    row.as_ref().map(map_article).transpose()
}

#[instrument(skip_all)]
pub async fn insert_partner(
    pool: &Pool,
    name: &str,
    description: Option<&str>,
    logo_url: Option<&str>,
    website_url: Option<&str>,
    display_order: i64,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO partners (name, description, logo_url, website_url, display_order) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(description)
    .bind(logo_url)
    .bind(website_url)
    .bind(display_order)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn active_partners(pool: &Pool) -> Result<Vec<Partner>> {
    let rows = sqlx::query(
        "SELECT id, name, description, logo_url, website_url, display_order FROM partners \
         WHERE is_active = 1 ORDER BY display_order ASC, name ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(Partner {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                description: row.try_get("description")?,
                logo_url: row.try_get("logo_url")?,
                website_url: row.try_get("website_url")?,
                display_order: row.try_get("display_order")?,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn content_section(pool: &Pool, section: &str) -> Result<Option<WebsiteContent>> {
    let row = sqlx::query(
        "SELECT section, title, body, updated_at FROM website_content WHERE section = ?",
    )
    .bind(section)
    .fetch_optional(pool)
    .await?;
    row.map(|row| {
        Ok(WebsiteContent {
            section: row.try_get("section")?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            updated_at: row.try_get("updated_at")?,
        })
    })
    .transpose()
}

#[instrument(skip_all)]
pub async fn upsert_content_section(
    pool: &Pool,
    section: &str,
    title: Option<&str>,
    body: &str,
    updated_by: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO website_content (section, title, body, updated_by) VALUES (?, ?, ?, ?) \
         ON CONFLICT(section) DO UPDATE SET title = excluded.title, body = excluded.body, \
         updated_by = excluded.updated_by, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(section)
    .bind(title)
    .bind(body)
    .bind(updated_by)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Audit, consent and analytics
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(event_type = %event.event_type))]
pub async fn insert_audit_event(pool: &Pool, event: &AuditEvent) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO security_audit_log (request_id, event_type, user_id, ip_hash, details) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&event.event_type)
    .bind(event.user_id)
    .bind(&event.ip_hash)
    .bind(event.details.to_string())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn count_audit_events(pool: &Pool, event_type: &str) -> Result<i64> {
    let cnt = sqlx::query_scalar("SELECT COUNT(*) FROM security_audit_log WHERE event_type = ?")
        .bind(event_type)
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}

#[instrument(skip_all)]
pub async fn upsert_consent(
    pool: &Pool,
    ip_hash: &str,
    choices: &ConsentChoices,
    version: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO cookie_consent_tracking (ip_hash, necessary, analytics, marketing, preferences, consent_version) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(ip_hash) DO UPDATE SET necessary = excluded.necessary, analytics = excluded.analytics, \
         marketing = excluded.marketing, preferences = excluded.preferences, \
         consent_version = excluded.consent_version, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(ip_hash)
    .bind(choices.necessary)
    .bind(choices.analytics)
    .bind(choices.marketing)
    .bind(choices.preferences)
    .bind(version)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn consent_for(pool: &Pool, ip_hash: &str) -> Result<Option<CookieConsent>> {
    let row = sqlx::query(
        "SELECT ip_hash, necessary, analytics, marketing, preferences, consent_version, updated_at \
         FROM cookie_consent_tracking WHERE ip_hash = ?",
    )
    .bind(ip_hash)
    .fetch_optional(pool)
    .await?;
    row.map(|row| {
        Ok(CookieConsent {
            ip_hash: row.try_get("ip_hash")?,
            choices: ConsentChoices {
                necessary: row.try_get("necessary")?,
                analytics: row.try_get("analytics")?,
                marketing: row.try_get("marketing")?,
                preferences: row.try_get("preferences")?,
            },
            consent_version: row.try_get("consent_version")?,
            updated_at: row.try_get("updated_at")?,
        })
    })
    .transpose()
}

#[instrument(skip_all)]
pub async fn insert_visit(pool: &Pool, visit: &VisitRecord) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO visitor_analytics (ip_hash, page_path, referrer_host, user_agent, session_id, country) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&visit.ip_hash)
    .bind(&visit.page_path)
    .bind(&visit.referrer_host)
    .bind(&visit.user_agent)
    .bind(&visit.session_id)
    .bind(&visit.country)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

// ---------------------------------------------------------------------------
// Social posts
// ---------------------------------------------------------------------------

/// Store a scheduled post and enqueue its publish task atomically.
#[instrument(skip_all)]
pub async fn insert_social_post(
    pool: &Pool,
    platform: SocialPlatform,
    content: &str,
    image_url: Option<&str>,
    scheduled_at: DateTime<Utc>,
    created_by: Option<i64>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let rec = sqlx::query(
        "INSERT INTO social_media_posts (platform, content, image_url, status, created_by, scheduled_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(platform.as_str())
    .bind(content)
    .bind(image_url)
    .bind(PostStatus::Scheduled.as_str())
    .bind(created_by)
    .bind(scheduled_at)
    .fetch_one(&mut *tx)
    .await?;
    let id: i64 = rec.get("id");
    enqueue_outbox_tx(&mut tx, OutboxKind::PublishSocialPost, id, scheduled_at).await?;
    tx.commit().await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn social_post(pool: &Pool, id: i64) -> Result<Option<SocialPost>> {
    let row = sqlx::query(
        "SELECT id, platform, content, image_url, status, external_id, scheduled_at, published_at \
         FROM social_media_posts WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(|row| {
        let platform: String = row.try_get("platform")?;
        let status: String = row.try_get("status")?;
        Ok(SocialPost {
            id: row.try_get("id")?,
            platform: SocialPlatform::parse_platform(&platform)
                .ok_or_else(|| anyhow!("unknown platform {platform}"))?,
            content: row.try_get("content")?,
            image_url: row.try_get("image_url")?,
            status: PostStatus::parse_status(&status)
                .ok_or_else(|| anyhow!("unknown post status {status}"))?,
            external_id: row.try_get("external_id")?,
            scheduled_at: row.try_get("scheduled_at")?,
            published_at: row.try_get("published_at")?,
        })
    })
    .transpose()
}

#[instrument(skip_all)]
pub async fn mark_social_post_published(pool: &Pool, id: i64, external_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE social_media_posts SET status = 'published', external_id = ?, last_error = NULL, \
         published_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(external_id)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_social_post_failed(pool: &Pool, id: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE social_media_posts SET status = 'failed', last_error = ? WHERE id = ?")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_social_post_error(pool: &Pool, id: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE social_media_posts SET last_error = ? WHERE id = ?")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Upsert a post that was published outside this service and reported by a
/// webhook. Returns the row id.
#[instrument(skip_all)]
pub async fn upsert_ingested_social_post(
    pool: &Pool,
    platform: SocialPlatform,
    external_id: &str,
    content: &str,
    image_url: Option<&str>,
    published_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO social_media_posts (platform, content, image_url, status, external_id, scheduled_at, published_at) \
         VALUES (?, ?, ?, 'published', ?, ?, ?) \
         ON CONFLICT(platform, external_id) WHERE external_id IS NOT NULL DO UPDATE SET \
         content = excluded.content, image_url = excluded.image_url \
         RETURNING id",
    )
    .bind(platform.as_str())
    .bind(content)
    .bind(image_url)
    .bind(external_id)
    .bind(published_at)
    .bind(published_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn upsert_linkedin_post(pool: &Pool, post: &LinkedInPost) -> Result<()> {
    sqlx::query(
        "INSERT INTO linkedin_posts (external_id, kind, text, url, posted_on) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(external_id) DO UPDATE SET kind = excluded.kind, text = excluded.text, \
         url = excluded.url, posted_on = excluded.posted_on",
    )
    .bind(&post.external_id)
    .bind(&post.kind)
    .bind(&post.text)
    .bind(&post.url)
    .bind(post.posted_on)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn linkedin_posts(pool: &Pool, limit: i64) -> Result<Vec<LinkedInPost>> {
    let rows = sqlx::query(
        "SELECT external_id, kind, text, url, posted_on FROM linkedin_posts \
         ORDER BY posted_on DESC, ingested_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(LinkedInPost {
                external_id: row.try_get("external_id")?,
                kind: row.try_get("kind")?,
                text: row.try_get("text")?,
                url: row.try_get("url")?,
                posted_on: row.try_get("posted_on")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Integration tokens
// ---------------------------------------------------------------------------

/// Store a provider token in the legacy clear-text column.
#[instrument(skip_all)]
pub async fn upsert_plaintext_token(pool: &Pool, provider: &str, token: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO integration_tokens (provider, access_token) VALUES (?, ?) \
         ON CONFLICT(provider) DO UPDATE SET access_token = excluded.access_token, \
         access_token_enc = NULL, token_nonce = NULL, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(provider)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn plaintext_integration_tokens(pool: &Pool) -> Result<Vec<PlaintextToken>> {
    let rows = sqlx::query(
        "SELECT id, provider, access_token FROM integration_tokens WHERE access_token IS NOT NULL ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(PlaintextToken {
                id: row.try_get("id")?,
                provider: row.try_get("provider")?,
                token: row.try_get("access_token")?,
            })
        })
        .collect()
}

/// Write the sealed value and clear the clear-text column in one statement.
#[instrument(skip_all)]
pub async fn store_encrypted_token(pool: &Pool, id: i64, sealed: &Sealed) -> Result<()> {
    sqlx::query(
        "UPDATE integration_tokens SET access_token_enc = ?, token_nonce = ?, access_token = NULL, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(&sealed.ciphertext)
    .bind(&sealed.nonce)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn encrypted_integration_token(pool: &Pool, provider: &str) -> Result<Option<Sealed>> {
    let row = sqlx::query(
        "SELECT access_token_enc, token_nonce FROM integration_tokens \
         WHERE provider = ? AND access_token_enc IS NOT NULL",
    )
    .bind(provider)
    .fetch_optional(pool)
    .await?;
    row.map(|row| {
        Ok(Sealed {
            ciphertext: row.try_get("access_token_enc")?,
            nonce: row.try_get("token_nonce")?,
        })
    })
    .transpose()
}

// ---------------------------------------------------------------------------
// Calendly
// ---------------------------------------------------------------------------

/// Record a scheduling conversion. Returns false when the session already has
/// one.
#[instrument(skip_all)]
pub async fn record_conversion(
    pool: &Pool,
    session_id: &str,
    event_uri: Option<&str>,
    invitee_uri: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO calendly_conversions (session_id, event_uri, invitee_uri) VALUES (?, ?, ?)",
    )
    .bind(session_id)
    .bind(event_uri)
    .bind(invitee_uri)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn enqueue_outbox(
    pool: &Pool,
    kind: OutboxKind,
    ref_id: i64,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_outbox_tx(&mut tx, kind, ref_id, due_at).await?;
    tx.commit().await?;
    Ok(id)
}

async fn enqueue_outbox_tx(
    tx: &mut Transaction<'_, Sqlite>,
    kind: OutboxKind,
    ref_id: i64,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO outbox (kind, ref_id, attempt, due_at) VALUES (?, ?, 0, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(ref_id)
    .bind(due_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_outbox(pool: &Pool) -> Result<Option<OutboxTask>> {
    let row = sqlx::query(
        "SELECT id, kind, ref_id, attempt FROM outbox WHERE datetime(due_at) <= CURRENT_TIMESTAMP \
         ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    row.map(|row| {
        let kind: String = row.try_get("kind")?;
        Ok(OutboxTask {
            id: row.try_get("id")?,
            kind: OutboxKind::parse_kind(&kind).ok_or_else(|| anyhow!("unknown outbox kind {kind}"))?,
            ref_id: row.try_get("ref_id")?,
            attempt: row.try_get("attempt")?,
        })
    })
    .transpose()
}

#[instrument(skip_all)]
pub async fn delete_outbox(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_outbox(pool: &Pool) -> Result<i64> {
    let cnt = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (no cap when
/// the cap is not positive).
#[instrument(skip_all)]
pub async fn backoff_outbox_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
) -> Result<()> {
    let secs = backoff_secs(attempt, max_cap_secs);
    sqlx::query(
        "UPDATE outbox SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Database-side health function: a round trip plus a few cheap counts.
#[instrument(skip_all)]
pub async fn database_health(pool: &Pool) -> Result<DatabaseHealth> {
    let started = Instant::now();
    let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(pool).await?;
    let published_articles: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM articles WHERE status = 'published'")
            .fetch_one(pool)
            .await?;
    let pending_outbox = count_outbox(pool).await?;
    Ok(DatabaseHealth {
        ok: one == 1,
        latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        published_articles,
        pending_outbox,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn draft(slug: &str, status: ArticleStatus) -> ArticleDraft {
        ArticleDraft {
            slug: slug.into(),
            title: format!("Title {slug}"),
            excerpt: None,
            content: "<p>Body</p>".into(),
            category: Some("Analysis".into()),
            author: None,
            status,
        }
    }

    #[test]
    fn sqlite_urls_are_normalised() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/db.sqlite");
        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_secs(0, 600), 5);
        assert_eq!(backoff_secs(3, 600), 40);
        assert_eq!(backoff_secs(10, 600), 600);
        assert_eq!(backoff_secs(30, 0), 5 * 1024);
    }

    #[tokio::test]
    async fn published_articles_only() {
        let pool = setup_pool().await;
        insert_article(&pool, &draft("a", ArticleStatus::Published), None).await.unwrap();
        insert_article(&pool, &draft("b", ArticleStatus::Draft), None).await.unwrap();
        let id = insert_article(&pool, &draft("c", ArticleStatus::Draft), None).await.unwrap();

        let list = published_articles(&pool, 50).await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].published_at.is_some());
        assert!(article_by_slug(&pool, "b").await.unwrap().is_none());

        assert!(update_article(&pool, id, &draft("c", ArticleStatus::Published)).await.unwrap());
        let c = article_by_slug(&pool, "c").await.unwrap().unwrap();
        let first_published = c.published_at.unwrap();
        assert!(update_article(&pool, id, &draft("c", ArticleStatus::Published)).await.unwrap());
        let again = article_by_slug(&pool, "c").await.unwrap().unwrap();
        assert_eq!(again.published_at.unwrap(), first_published);
        assert!(!update_article(&pool, 999, &draft("z", ArticleStatus::Draft)).await.unwrap());
    }

    #[tokio::test]
    async fn user_search_escapes_wildcards_and_limits() {
        let pool = setup_pool().await;
        for i in 0..12 {
            create_user(&pool, &format!("analyst{i}@example.com"), None).await.unwrap();
        }
        let odd = create_user(&pool, "under_score@example.com", None).await.unwrap();
        grant_role(&pool, odd, UserRole::Admin).await.unwrap();
        grant_role(&pool, odd, UserRole::Editor).await.unwrap();

        assert_eq!(search_users(&pool, "ANALYST", 10).await.unwrap().len(), 10);
        let hits = search_users(&pool, "_", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].roles, vec!["admin".to_string(), "editor".to_string()]);
        assert!(search_users(&pool, "%", 10).await.unwrap().is_empty());
        // Same email maps to the same user.
        assert_eq!(create_user(&pool, " Under_Score@example.com", None).await.unwrap(), odd);
    }

    #[tokio::test]
    async fn access_tokens_revoke_once() {
        let pool = setup_pool().await;
        let uid = create_user(&pool, "a@example.com", None).await.unwrap();
        let expires = Utc::now() + chrono::Duration::hours(1);
        let tid = insert_access_token(&pool, uid, "hash", expires).await.unwrap();
        let row = find_access_token(&pool, "hash").await.unwrap().unwrap();
        assert!(row.is_usable(Utc::now()));
        assert!(revoke_access_token(&pool, tid).await.unwrap());
        assert!(!revoke_access_token(&pool, tid).await.unwrap());
        let row = find_access_token(&pool, "hash").await.unwrap().unwrap();
        assert!(!row.is_usable(Utc::now()));
    }

    #[tokio::test]
    async fn consent_upsert_overwrites() {
        let pool = setup_pool().await;
        let mut choices = ConsentChoices {
            necessary: true,
            analytics: true,
            ..Default::default()
        };
        upsert_consent(&pool, "ip", &choices, "v1").await.unwrap();
        choices.analytics = false;
        upsert_consent(&pool, "ip", &choices, "v2").await.unwrap();
        let stored = consent_for(&pool, "ip").await.unwrap().unwrap();
        assert!(!stored.choices.analytics);
        assert_eq!(stored.consent_version, "v2");
        assert!(consent_for(&pool, "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversions_are_recorded_once() {
        let pool = setup_pool().await;
        assert!(record_conversion(&pool, "s1", Some("e"), None).await.unwrap());
        assert!(!record_conversion(&pool, "s1", Some("e"), None).await.unwrap());
        assert!(record_conversion(&pool, "s2", None, None).await.unwrap());
    }

    #[tokio::test]
    async fn ingested_posts_upsert_by_external_id() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let a = upsert_ingested_social_post(&pool, SocialPlatform::Instagram, "ig-1", "first", None, now)
            .await
            .unwrap();
        let b = upsert_ingested_social_post(&pool, SocialPlatform::Instagram, "ig-1", "edited", None, now)
            .await
            .unwrap();
        assert_eq!(a, b);
        let post = social_post(&pool, a).await.unwrap().unwrap();
        assert_eq!(post.content, "edited");
        assert_eq!(post.status, PostStatus::Published);
        assert_eq!(count_outbox(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn database_health_reports_counts() {
        let pool = setup_pool().await;
        insert_article(&pool, &draft("a", ArticleStatus::Published), None).await.unwrap();
        insert_social_post(&pool, SocialPlatform::LinkedIn, "hi", None, Utc::now(), None)
            .await
            .unwrap();
        let health = database_health(&pool).await.unwrap();
        assert!(health.ok);
        assert_eq!(health.published_articles, 1);
        assert_eq!(health.pending_outbox, 1);
    }
}
