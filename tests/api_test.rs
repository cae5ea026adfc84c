use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::Duration;
use counsel_edge::auth::issue_token;
use counsel_edge::config::{self, Config};
use counsel_edge::db;
use counsel_edge::model::{ArticleDraft, ArticleStatus, UserRole};
use counsel_edge::router::create_router;
use counsel_edge::security::rate_limit::{JsonFileStore, MemoryStore};
use counsel_edge::state::AppState;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.integrations.instagram.app_secret = None;
    cfg.integrations.linkedin.client_secret = None;
    cfg
}

async fn setup_with(cfg: Config) -> (Router, sqlx::SqlitePool) {
    let pool = setup_pool().await;
    let state = AppState::new(pool.clone(), cfg, Box::new(MemoryStore::default())).await.unwrap();
    (create_router(state), pool)
}

async fn setup() -> (Router, sqlx::SqlitePool) {
    setup_with(test_config()).await
}

struct Sent {
    status: StatusCode,
    headers: axum::http::HeaderMap,
    body: Vec<u8>,
}

impl Sent {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

async fn send(app: &Router, req: Request<Body>) -> Sent {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec();
    Sent {
        status,
        headers,
        body,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
}

fn with_body(builder: axum::http::request::Builder, body: Value) -> Request<Body> {
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn user_token(pool: &sqlx::SqlitePool, email: &str, admin: bool) -> String {
    let user_id = db::create_user(pool, email, None).await.unwrap();
    if admin {
        db::grant_role(pool, user_id, UserRole::Admin).await.unwrap();
    }
    issue_token(pool, user_id, Duration::hours(1)).await.unwrap().token
}

async fn csrf_for(app: &Router, token: &str) -> String {
    let res = send(
        app,
        Request::builder()
            .uri("/auth/csrf")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status, StatusCode::OK);
    let body = res.json();
    assert_eq!(body["header"], "x-csrf-token");
    body["token"].as_str().unwrap().to_string()
}

fn article(slug: &str) -> Value {
    json!({
        "slug": slug,
        "title": "Black Sea shipping outlook",
        "content": "<p>Insurance premia keep rising.</p><p></p>",
        "status": "published",
    })
}

#[tokio::test]
async fn health_reports_database_and_csp_header() {
    let (app, _pool) = setup().await;
    let res = send(&app, get("/health")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.json()["status"], "healthy");
    let csp = res.headers[header::CONTENT_SECURITY_POLICY].to_str().unwrap();
    assert!(csp.contains("default-src 'self'"));
    assert!(csp.contains("'nonce-"));
}

#[tokio::test]
async fn unknown_routes_and_methods_answer_json() {
    let (app, _pool) = setup().await;

    let res = send(&app, get("/no-such-thing")).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.json()["error"], "route not found");

    let res = send(&app, get("/analytics")).await;
    assert_eq!(res.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(res.json()["error"], "method not allowed");

    let req = Request::builder()
        .method(Method::POST)
        .uri("/analytics")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert!(res.json()["error"].as_str().unwrap().starts_with("invalid JSON body"));
}

#[tokio::test]
async fn analytics_needs_consent_first() {
    let (app, pool) = setup().await;
    let visit = json!({
        "pagePath": "/insights",
        "referrer": "https://news.example.org/story?id=1",
        "country": "de",
    });

    let req = with_body(
        json_request(Method::POST, "/analytics").header("x-forwarded-for", "203.0.113.5"),
        visit.clone(),
    );
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.json()["consentRequired"], true);

    let choices = json!({ "analytics": true, "marketing": false });
    let req = with_body(
        json_request(Method::POST, "/cookie-consent")
            .header("x-forwarded-for", "203.0.113.5"),
        choices,
    );
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::OK);
    let consent = &res.json()["consent"];
    assert_eq!(consent["necessary"], true);
    assert_eq!(consent["analytics"], true);
    assert_eq!(consent["consentVersion"], "1.0");

    let req = with_body(
        json_request(Method::POST, "/analytics").header("x-forwarded-for", "203.0.113.5"),
        visit.clone(),
    );
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::CREATED);
    assert_eq!(res.json()["success"], true);

    // A different visitor has not consented.
    let req = with_body(
        json_request(Method::POST, "/analytics").header("x-forwarded-for", "198.51.100.1"),
        visit,
    );
    assert_eq!(send(&app, req).await.status, StatusCode::FORBIDDEN);

    let (host, country): (Option<String>, Option<String>) =
        sqlx::query_as("SELECT referrer_host, country FROM visitor_analytics")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(host.as_deref(), Some("news.example.org"));
    assert_eq!(country.as_deref(), Some("DE"));
}

#[tokio::test]
async fn consent_writes_are_rate_limited() {
    let mut cfg = test_config();
    cfg.security.rate_limits.consent.max_attempts = 2;
    let (app, _pool) = setup_with(cfg).await;

    let choices = json!({ "analytics": false });
    for _ in 0..2 {
        let req = with_body(
            json_request(Method::POST, "/cookie-consent").header("x-real-ip", "192.0.2.4"),
            choices.clone(),
        );
        assert_eq!(send(&app, req).await.status, StatusCode::OK);
    }
    let req = with_body(
        json_request(Method::POST, "/cookie-consent").header("x-real-ip", "192.0.2.4"),
        choices,
    );
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(res.json()["retryAfterMs"].as_u64().unwrap() > 0);
    assert!(res.headers.contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn admin_search_checks_auth_then_role_and_caps_results() {
    let (app, pool) = setup().await;
    for i in 0..12 {
        db::create_user(&pool, &format!("analyst{i:02}@firm.test"), None)
            .await
            .unwrap();
    }
    let admin = user_token(&pool, "chief@firm.test", true).await;
    let viewer = user_token(&pool, "intern@firm.test", false).await;
    let query = json!({ "email": "analyst" });

    let req = with_body(json_request(Method::POST, "/admin/users/search"), query.clone());
    assert_eq!(send(&app, req).await.status, StatusCode::UNAUTHORIZED);

    let req = with_body(
        json_request(Method::POST, "/admin/users/search")
            .header(header::AUTHORIZATION, "Bearer not-a-real-token"),
        query.clone(),
    );
    assert_eq!(send(&app, req).await.status, StatusCode::UNAUTHORIZED);

    let req = with_body(
        json_request(Method::POST, "/admin/users/search")
            .header(header::AUTHORIZATION, format!("Bearer {viewer}")),
        query.clone(),
    );
    assert_eq!(send(&app, req).await.status, StatusCode::FORBIDDEN);
    assert_eq!(db::count_audit_events(&pool, "admin_access_denied").await.unwrap(), 1);

    let req = with_body(
        json_request(Method::POST, "/admin/users/search")
            .header(header::AUTHORIZATION, format!("Bearer {admin}")),
        query,
    );
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::OK);
    let users = res.json()["users"].as_array().unwrap().clone();
    assert_eq!(users.len(), 10);
    assert!(users
        .iter()
        .all(|u| u["email"].as_str().unwrap().starts_with("analyst")));
}

#[tokio::test]
async fn admin_mutations_require_csrf() {
    let (app, pool) = setup().await;
    let admin = user_token(&pool, "editor@firm.test", true).await;
    let payload = article("black-sea-outlook");

    let req = with_body(
        json_request(Method::POST, "/admin/articles")
            .header(header::AUTHORIZATION, format!("Bearer {admin}")),
        payload.clone(),
    );
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.json()["error"], "invalid or missing CSRF token");

    let csrf = csrf_for(&app, &admin).await;
    let req = with_body(
        json_request(Method::POST, "/admin/articles")
            .header(header::AUTHORIZATION, format!("Bearer {admin}"))
            .header("x-csrf-token", "0".repeat(csrf.len())),
        payload.clone(),
    );
    assert_eq!(send(&app, req).await.status, StatusCode::FORBIDDEN);

    let req = with_body(
        json_request(Method::POST, "/admin/articles")
            .header(header::AUTHORIZATION, format!("Bearer {admin}"))
            .header("x-csrf-token", csrf.clone()),
        payload.clone(),
    );
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::CREATED);
    assert_eq!(res.json()["slug"], "black-sea-outlook");

    let req = with_body(
        json_request(Method::POST, "/admin/articles")
            .header(header::AUTHORIZATION, format!("Bearer {admin}"))
            .header("x-csrf-token", csrf),
        payload,
    );
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.json()["error"], "slug already exists");

    let res = send(&app, get("/articles/black-sea-outlook")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.json()["content"], "<p>Insurance premia keep rising.</p>");
}

#[tokio::test]
async fn sign_out_revokes_the_token() {
    let (app, pool) = setup().await;
    let token = user_token(&pool, "partner@firm.test", false).await;
    let auth = format!("Bearer {token}");

    let res = send(
        &app,
        Request::builder()
            .uri("/auth/session")
            .header(header::AUTHORIZATION, auth.clone())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status, StatusCode::OK);
    let body = res.json();
    assert_eq!(body["isAdmin"], false);
    assert_eq!(body["timeoutSecs"], 3600);
    assert_eq!(body["session"]["expired"], false);

    let ping = json!({ "event": "keydown" });
    let req = with_body(
        json_request(Method::POST, "/auth/activity").header(header::AUTHORIZATION, auth.clone()),
        ping,
    );
    assert_eq!(send(&app, req).await.status, StatusCode::OK);

    let req = Request::builder()
        .method(Method::POST)
        .uri("/auth/sign-out")
        .header(header::AUTHORIZATION, auth.clone())
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, req).await.status, StatusCode::OK);
    assert_eq!(db::count_audit_events(&pool, "sign_out").await.unwrap(), 1);

    let res = send(
        &app,
        Request::builder()
            .uri("/auth/session")
            .header(header::AUTHORIZATION, auth)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sanitize_preview_matches_storage_rules() {
    let (app, _pool) = setup().await;
    let html = json!({ "html": "<div><p> </p></div><p>Strattegy for www.example.com</p>" });
    let res = send(&app, with_body(json_request(Method::POST, "/content/sanitize"), html)).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.json()["html"], "<p>Strattegy for www.example.com</p>");

    let both = json!({ "html": "<p>x</p>", "fields": { "name": "y" } });
    let res = send(&app, with_body(json_request(Method::POST, "/content/sanitize"), both)).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn feeds_list_articles_and_pages() {
    let (app, pool) = setup().await;
    for slug in ["energy-corridors", "sanctions-watch"] {
        let draft = ArticleDraft {
            slug: slug.into(),
            title: format!("On {slug}"),
            excerpt: None,
            content: "<p>Body</p>".into(),
            category: Some("Analysis".into()),
            author: None,
            status: ArticleStatus::Published,
        };
        db::insert_article(&pool, &draft, None).await.unwrap();
    }
    let draft = ArticleDraft {
        slug: "unpublished".into(),
        title: "Hidden".into(),
        excerpt: None,
        content: "<p>Body</p>".into(),
        category: None,
        author: None,
        status: ArticleStatus::Draft,
    };
    db::insert_article(&pool, &draft, None).await.unwrap();

    let res = send(&app, get("/sitemap.xml")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert!(res.headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("application/xml"));
    let xml = res.text();
    assert_eq!(xml.matches("<url>").count(), 2 + 4);
    assert!(xml.contains("https://www.example.com/articles/energy-corridors"));
    assert!(!xml.contains("unpublished"));

    let res = send(&app, get("/rss.xml")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.text().matches("<item>").count(), 2 + 4);
}

#[tokio::test]
async fn shell_gets_a_fresh_nonce() {
    let dir = tempfile::tempdir().unwrap();
    let shell = dir.path().join("index.html");
    std::fs::write(
        &shell,
        "<html><head><style>body{}</style></head><body><script>boot()</script></body></html>",
    )
    .unwrap();
    let mut cfg = test_config();
    cfg.site.shell_path = Some(shell.to_string_lossy().into_owned());
    let (app, _pool) = setup_with(cfg).await;

    let first = send(&app, get("/")).await;
    assert_eq!(first.status, StatusCode::OK);
    let csp = first.headers[header::CONTENT_SECURITY_POLICY].to_str().unwrap();
    let nonce = csp
        .split("'nonce-")
        .nth(1)
        .and_then(|rest| rest.split('\'').next())
        .unwrap()
        .to_string();
    let html = first.text();
    assert!(html.contains(&format!(r#"<script nonce="{nonce}">"#)));
    assert!(html.contains(&format!(r#"<style nonce="{nonce}">"#)));

    let second = send(&app, get("/")).await;
    assert!(!second.text().contains(&nonce));
}

#[tokio::test]
async fn instagram_subscription_handshake() {
    let (app, _pool) = setup().await;
    let res = send(
        &app,
        get("/webhooks/instagram?hub.mode=subscribe&hub.verify_token=YOUR_WEBHOOK_VERIFY_TOKEN&hub.challenge=1158201444"),
    )
    .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.text(), "1158201444");

    let res = send(
        &app,
        get("/webhooks/instagram?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1"),
    )
    .await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn calendly_messages_from_other_origins_are_rejected() {
    let (app, _pool) = setup().await;
    let msg = json!({
        "origin": "https://evil.example",
        "sessionId": "abc",
        "event": "calendly.event_scheduled",
    });
    let res = send(&app, with_body(json_request(Method::POST, "/calendly/events"), msg)).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
}

fn hmac_hex(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

async fn instagram_rows(pool: &sqlx::SqlitePool, media_id: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM social_media_posts WHERE platform = 'instagram' AND external_id = ?",
    )
    .bind(media_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

fn signed_config() -> Config {
    let mut cfg = test_config();
    cfg.integrations.instagram.app_secret = Some("ig-app-secret".into());
    cfg.integrations.linkedin.client_secret = Some("li-client-secret".into());
    cfg
}

fn webhook(uri: &str, signature: Option<(&str, String)>, body: &str) -> Request<Body> {
    let mut builder = json_request(Method::POST, uri);
    if let Some((name, value)) = signature {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn instagram_webhook_requires_a_valid_signature() {
    let (app, pool) = setup_with(signed_config()).await;
    let body = json!({
        "object": "instagram",
        "entry": [{
            "id": "1784",
            "time": 1_767_225_600,
            "changes": [{
                "field": "media",
                "value": {
                    "media_id": "ig-9001",
                    "caption": "Field notes from Tbilisi",
                    "media_url": "https://cdn.test/9001.jpg",
                },
            }],
        }],
    })
    .to_string();
    let header = "x-hub-signature-256";

    let res = send(&app, webhook("/webhooks/instagram", None, &body)).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.json()["error"], "missing webhook signature");

    let forged = format!("sha256={}", hmac_hex("someone-else", body.as_bytes()));
    let res = send(&app, webhook("/webhooks/instagram", Some((header, forged)), &body)).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.json()["error"], "invalid webhook signature");

    assert_eq!(instagram_rows(&pool, "ig-9001").await, 0);

    let good = format!("sha256={}", hmac_hex("ig-app-secret", body.as_bytes()));
    let res = send(&app, webhook("/webhooks/instagram", Some((header, good)), &body)).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.json()["ingested"], 1);
    assert_eq!(instagram_rows(&pool, "ig-9001").await, 1);
}

#[tokio::test]
async fn linkedin_webhook_requires_a_valid_signature() {
    let (app, _pool) = setup_with(signed_config()).await;
    let body = json!({
        "elements": [{
            "id": "urn:li:share:7007",
            "kind": "post",
            "text": "New brief on Red Sea shipping risk",
            "url": "https://www.linkedin.com/feed/update/urn:li:share:7007",
            "publishedAt": 1_767_225_600_000_i64,
        }],
    })
    .to_string();
    let header = "x-li-signature";

    let res = send(&app, webhook("/webhooks/linkedin", None, &body)).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);

    // Signed over a different body.
    let stale = hmac_hex("li-client-secret", b"{}");
    let res = send(&app, webhook("/webhooks/linkedin", Some((header, stale)), &body)).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert!(send(&app, get("/linkedin/posts")).await.json().as_array().unwrap().is_empty());

    let good = hmac_hex("li-client-secret", body.as_bytes());
    let res = send(&app, webhook("/webhooks/linkedin", Some((header, good)), &body)).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.json()["ingested"], 1);

    let posts = send(&app, get("/linkedin/posts")).await.json();
    let posts = posts.as_array().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["externalId"], "urn:li:share:7007");
    assert_eq!(posts[0]["postedOn"], "2026-01-01");
}

#[tokio::test]
async fn csp_reports_are_audited_and_malformed_ones_rejected() {
    let (app, pool) = setup().await;
    let report = json!({
        "csp-report": {
            "document-uri": "https://www.example.com/insights",
            "violated-directive": "script-src-elem",
            "effective-directive": "script-src-elem",
            "blocked-uri": "https://tracker.test/x.js",
            "line-number": 12,
        }
    });
    let req = Request::builder()
        .method(Method::POST)
        .uri("/csp-report")
        .header(header::CONTENT_TYPE, "application/csp-report")
        .body(Body::from(report.to_string()))
        .unwrap();
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::NO_CONTENT);
    assert_eq!(db::count_audit_events(&pool, "csp_violation").await.unwrap(), 1);

    let req = Request::builder()
        .method(Method::POST)
        .uri("/csp-report")
        .header(header::CONTENT_TYPE, "application/csp-report")
        .body(Body::from("{\"csp-report\": 42"))
        .unwrap();
    let res = send(&app, req).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.json()["error"], "invalid csp-report");
    assert_eq!(db::count_audit_events(&pool, "csp_violation").await.unwrap(), 1);
}

#[tokio::test]
async fn housekeeping_persists_rate_limits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rate_limits.json");
    let pool = setup_pool().await;
    let store = JsonFileStore::open(&path).unwrap();
    let state = AppState::new(pool, test_config(), Box::new(store)).await.unwrap();
    let app = create_router(state.clone());

    let req = with_body(
        json_request(Method::POST, "/cookie-consent").header("x-real-ip", "192.0.2.9"),
        json!({ "analytics": false }),
    );
    assert_eq!(send(&app, req).await.status, StatusCode::OK);
    // Handlers never write the file themselves.
    assert!(!path.exists());

    counsel_edge::housekeeping_pass(&state).await;
    let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved.as_object().unwrap().len(), 1);
}
