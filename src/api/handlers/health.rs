//! Health check handlers.

use axum::extract::State;
use axum::http::StatusCode;

use crate::api::SharedState;

/// Liveness probe.
pub async fn health_check() -> &'static str {
    "ok"
}

/// Readiness probe: verifies the store answers.
pub async fn readiness_check(State(state): State<SharedState>) -> Result<&'static str, StatusCode> {
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok("ready")
}
