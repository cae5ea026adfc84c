//! Router Configuration
//!
//! Every edge function is mounted here. Unknown paths answer a JSON 404 and
//! known paths with the wrong method a JSON 405.

use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method,
    },
    middleware,
    routing::{get, post, put},
    Router,
};
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::error::ApiError;
use crate::handlers::{
    admin, content, feeds, health, integrations, security, session, shell, visitors,
};
use crate::security::csrf::CSRF_HEADER;
use crate::state::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/", get(shell::index))
        .route("/sitemap.xml", get(feeds::sitemap))
        .route("/rss.xml", get(feeds::rss))
        .route("/health", get(health::health))
        .route("/analytics", post(visitors::ingest_analytics))
        .route(
            "/cookie-consent",
            post(visitors::record_consent).get(visitors::get_consent),
        )
        .route("/articles", get(content::list_articles))
        .route("/articles/{slug}", get(content::get_article))
        .route("/partners", get(content::partners))
        .route("/content/sanitize", post(content::sanitize_preview))
        .route("/content/{section}", get(content::content_section))
        .route("/csp-report", post(security::csp_report))
        .route("/economic-data/{series_id}", get(integrations::economic_data))
        .route("/calendly/events", post(integrations::calendly_event))
        .route("/linkedin/posts", get(integrations::linkedin_feed))
        .route(
            "/webhooks/instagram",
            get(integrations::instagram_verify).post(integrations::instagram_webhook),
        )
        .route("/webhooks/linkedin", post(integrations::linkedin_webhook));

    let auth = Router::new()
        .route("/auth/session", get(session::session_status))
        .route("/auth/activity", post(session::record_activity))
        .route("/auth/csrf", get(session::csrf_token))
        .route("/auth/sign-out", post(session::sign_out));

    let admin = Router::new()
        .route("/admin/users/search", post(admin::search_users))
        .route("/admin/articles", post(admin::create_article))
        .route("/admin/articles/{id}", put(admin::update_article))
        .route("/admin/content/{section}", put(admin::update_content))
        .route("/admin/social-posts", post(admin::schedule_social_post))
        .route("/admin/linkedin/publish", post(admin::publish_linkedin))
        .route("/admin/token-migration", post(admin::token_migration));

    public
        .merge(auth)
        .merge(admin)
        .method_not_allowed_fallback(method_not_allowed)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::csp_headers,
        ))
        .layer(cors_layer(&state.config().security.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn not_found() -> ApiError {
    ApiError::NotFound("route")
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim_end_matches('/')) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(?err, origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(CSRF_HEADER),
        ])
        .max_age(Duration::from_secs(60 * 60))
}
