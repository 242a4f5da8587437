use crate::error::ServerResult;
use crate::state::{ModelRegistry, ServerState};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

/// Reload the extractor and model blobs from disk
///
/// The new registry is built off the async runtime and swapped in whole;
/// requests already holding the old one finish against it.
pub async fn reload_models(
    State(state): State<Arc<ServerState>>,
) -> ServerResult<impl IntoResponse> {
    let config = Arc::clone(&state.config);
    let registry = tokio::task::spawn_blocking(move || ModelRegistry::load(&config)).await??;

    let loaded = registry.loaded_models();
    let extractor_loaded = registry.extractor_loaded();
    let loaded_at = registry.loaded_at();
    state.replace_registry(registry);
    tracing::info!(
        kmeans = loaded.kmeans,
        autoencoder = loaded.autoencoder,
        extractor_loaded,
        "model registry reloaded"
    );

    Ok(Json(json!({
        "status": "reloaded",
        "models_loaded": loaded,
        "extractor_loaded": extractor_loaded,
        "models_loaded_at": loaded_at.to_rfc3339(),
    })))
}
