use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::state::AppState;
use crate::storage::StorageError;

/// GET /health/live — returns 200 unconditionally.
/// Used by load balancers to check if the process is alive.
pub async fn liveness() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /health/ready — probes storage with a cheap read.
/// Returns 200 on success, 503 on failure. An empty key row is still a
/// healthy answer; only transport failures count as unready.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.get_keys().await {
        Ok(_) | Err(StorageError::NotFound) => {
            (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}
