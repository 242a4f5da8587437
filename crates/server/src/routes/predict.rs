use crate::error::{ServerError, ServerResult};
use crate::middleware::PredictionOutcome;
use crate::state::ServerState;
use anomaly::EnsembleVerdict;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use std::sync::Arc;

/// Multipart field carrying the image.
pub const FILE_FIELD: &str = "file";

/// Predict whether an uploaded package photo is counterfeit
///
/// Expects a multipart body with the image in the `file` field. Embedding and
/// scoring run on the blocking pool.
///
/// # Response
///
/// ```json
/// {
///   "is_fake": false,
///   "confidence": 1.0,
///   "model_details": {
///     "autoencoder": { "is_fake": false, "confidence": 0.83 },
///     "kmeans": { "is_fake": false, "confidence": 0.91 }
///   }
/// }
/// ```
pub async fn predict(
    State(state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> ServerResult<(Extension<PredictionOutcome>, Json<EnsembleVerdict>)> {
    let mut image = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, &state))?
    {
        if field.name() == Some(FILE_FIELD) {
            let bytes = field.bytes().await.map_err(|e| multipart_error(e, &state))?;
            image = Some(bytes);
            break;
        }
    }

    let image = image.ok_or_else(|| {
        ServerError::BadRequest(format!("multipart field '{FILE_FIELD}' is required"))
    })?;
    if image.is_empty() {
        return Err(ServerError::BadRequest("uploaded file is empty".to_string()));
    }

    let registry = state.registry();
    let ensemble = state.config.ensemble.clone();
    let verdict =
        tokio::task::spawn_blocking(move || registry.predict(&image, &ensemble)).await??;

    Ok((Extension(PredictionOutcome::from_verdict(&verdict)), Json(verdict)))
}

fn multipart_error(err: MultipartError, state: &ServerState) -> ServerError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge(state.config.max_body_size_mb)
    } else {
        ServerError::BadRequest(format!("invalid multipart body: {err}"))
    }
}
