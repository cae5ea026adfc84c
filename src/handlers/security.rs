//! CSP violation reports and the response-header middleware.

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use serde_json::json;
use tracing::{debug, warn};

use super::{client_ip_hash, throttle};
use crate::auth::record_audit;
use crate::error::ApiError;
use crate::model::AuditEvent;
use crate::security::csp::{apply_nonce, parse_violation};
use crate::state::AppState;

/// Largest HTML body the middleware will rewrite.
const MAX_HTML_BYTES: usize = 4 * 1024 * 1024;

pub async fn csp_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let ip_hash = client_ip_hash(&state, &headers);
    throttle(&state, "csp", &ip_hash, state.config().security.rate_limits.csp_report)?;
    let violation = parse_violation(&body).map_err(|_| ApiError::bad_request("invalid csp-report"))?;
    debug!(directive = %violation.violated_directive, blocked = %violation.blocked_uri, "csp violation");
    record_audit(
        state.pool(),
        AuditEvent::new("csp_violation").ip_hash(ip_hash).details(json!({
            "documentUri": violation.document_uri,
            "violatedDirective": violation.violated_directive,
            "effectiveDirective": violation.effective_directive,
            "blockedUri": violation.blocked_uri,
            "sourceFile": violation.source_file,
            "lineNumber": violation.line_number,
        })),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

/// Attach the Content-Security-Policy header. HTML responses get a fresh
/// nonce, written into their inline `<script>`/`<style>` tags.
pub async fn csp_headers(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let response = next.run(req).await;
    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/html"));

    let (mut response, policy) = if is_html {
        let nonce = state.csp().refresh();
        let policy = state.csp().policy().header_value(&nonce);
        let (mut parts, body) = response.into_parts();
        let response = match to_bytes(body, MAX_HTML_BYTES).await {
            Ok(bytes) => {
                let html = apply_nonce(&String::from_utf8_lossy(&bytes), &nonce);
                parts.headers.remove(header::CONTENT_LENGTH);
                Response::from_parts(parts, Body::from(html))
            }
            Err(err) => {
                warn!(?err, "failed to buffer HTML response");
                let mut failed = Response::new(Body::empty());
                *failed.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                failed
            }
        };
        (response, policy)
    } else {
        (response, state.csp().header_value())
    };

    match HeaderValue::from_str(&policy) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(header::CONTENT_SECURITY_POLICY, value);
        }
        Err(err) => warn!(?err, "CSP header is not a valid header value"),
    }
    response
}
