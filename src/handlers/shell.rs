use axum::{extract::State, response::Html};
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// Serve the single-page-app shell. The CSP middleware stamps the nonce.
pub async fn index(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let path = state
        .config()
        .site
        .shell_path
        .as_deref()
        .ok_or(ApiError::NotFound("page"))?;
    match tokio::fs::read_to_string(path).await {
        Ok(html) => Ok(Html(html)),
        Err(err) => {
            warn!(?err, path, "failed to read app shell");
            Err(ApiError::NotFound("page"))
        }
    }
}
