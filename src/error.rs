//! HTTP error taxonomy.
//!
//! Every handler returns `Result<_, ApiError>`. The variants are closed: each
//! maps to one status code, and `Internal` is the single fallback for
//! anything unexpected. Messages of `Internal` and `Upstream` are logged, not
//! returned.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("analytics consent required")]
    ConsentRequired,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("too many requests")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid or missing CSRF token")]
    CsrfRejected,

    #[error("upstream service error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::ConsentRequired | ApiError::CsrfRejected => {
                StatusCode::FORBIDDEN
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Internal(err) => {
                error!(?err, "request failed");
                json!({ "error": "internal server error" })
            }
            ApiError::Upstream(detail) => {
                error!(%detail, "upstream call failed");
                json!({ "error": "upstream service unavailable" })
            }
            ApiError::ConsentRequired => json!({
                "error": self.to_string(),
                "consentRequired": true,
            }),
            ApiError::RateLimited { retry_after_ms } => json!({
                "error": self.to_string(),
                "retryAfterMs": retry_after_ms,
            }),
            _ => json!({ "error": self.to_string() }),
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_ms } = self {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn body_of(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn consent_required_carries_flag() {
        let (status, body) = body_of(ApiError::ConsentRequired).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["consentRequired"], true);
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak() {
        let (status, body) =
            body_of(ApiError::Internal(anyhow::anyhow!("disk on fire at /var/db"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal server error");
    }

    #[tokio::test]
    async fn rate_limited_reports_retry_after() {
        let response = ApiError::RateLimited { retry_after_ms: 1500 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }
}
