use crate::error::{ServerError, ServerResult};
use crate::state::ServerState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use std::time::SystemTime;

/// Global server start time for uptime calculation
static SERVER_START_TIME: once_cell::sync::Lazy<SystemTime> =
    once_cell::sync::Lazy::new(SystemTime::now);

fn uptime_seconds() -> u64 {
    SERVER_START_TIME
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Health check endpoint (liveness)
///
/// Always 200 while the process runs; reports which models are loaded.
pub async fn health_check(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let registry = state.registry();
    Json(json!({
        "status": "healthy",
        "service": "medguard-server",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds(),
        "models_loaded": registry.loaded_models(),
        "extractor_loaded": registry.extractor_loaded(),
        "extractor_version": registry.extractor_version(),
        "models_loaded_at": registry.loaded_at().to_rfc3339(),
    }))
}

/// Readiness check endpoint
///
/// 503 until the extractor and at least one anomaly model are loaded.
pub async fn readiness_check(
    State(state): State<Arc<ServerState>>,
) -> ServerResult<impl IntoResponse> {
    let registry = state.registry();
    if !registry.is_ready() {
        return Err(ServerError::ModelNotLoaded(
            "extractor and at least one anomaly model are required".to_string(),
        ));
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "medguard-server",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds(),
        "models_loaded": registry.loaded_models(),
    })))
}
