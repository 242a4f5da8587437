//! API route handlers
//!
//! - `health`: liveness and readiness, including which models are loaded
//! - `predict`: counterfeit prediction for one uploaded image
//! - `models`: hot reload of the model registry

pub mod health;
pub mod models;
pub mod predict;

use crate::error::{ServerError, ServerResult};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

/// API version and base info
///
/// Returns server information including version and available endpoints.
///
/// # Response
///
/// ```json
/// {
///   "name": "MedGuard Server",
///   "version": "0.1.0",
///   "api_version": "v1",
///   "endpoints": ["..."]
/// }
/// ```
pub async fn api_info() -> ServerResult<impl IntoResponse> {
    Ok(Json(json!({
        "name": "MedGuard Server",
        "version": env!("CARGO_PKG_VERSION"),
        "api_version": "v1",
        "endpoints": [
            "/predict",
            "/api/v1/models/reload",
            "/health",
            "/ready"
        ]
    })))
}

/// 404 Not Found handler
pub async fn not_found() -> ServerError {
    ServerError::NotFound
}
