use axum::{extract::State, http::StatusCode, Json};

use crate::health::{check, HealthReport};
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let probe_url = state.config().health.probe_url.as_deref();
    let report = check(state.pool(), state.http(), probe_url).await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
