use anomaly::AnomalyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use embedding::EmbeddingError;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub type ServerResult<T> = Result<T, ServerError>;

/// Server error types
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large: max {0}MB allowed")]
    PayloadTooLarge(usize),

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Inference error: {0}")]
    Anomaly(#[from] AnomalyError),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found")]
    NotFound,
}

/// API error response structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ServerError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::ModelNotLoaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::NotFound => StatusCode::NOT_FOUND,
            // The upload itself is unreadable.
            ServerError::Embedding(EmbeddingError::Decode { .. }) => StatusCode::BAD_REQUEST,
            ServerError::Embedding(_)
            | ServerError::Anomaly(_)
            | ServerError::Internal(_)
            | ServerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::BadRequest(_) => "BAD_REQUEST",
            ServerError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ServerError::ModelNotLoaded(_) => "MODEL_NOT_LOADED",
            ServerError::Embedding(EmbeddingError::Decode { .. }) => "INVALID_IMAGE",
            ServerError::Embedding(_) => "EMBEDDING_ERROR",
            ServerError::Anomaly(_) => "INFERENCE_ERROR",
            ServerError::Internal(_) => "INTERNAL_ERROR",
            ServerError::Config(_) => "CONFIG_ERROR",
            ServerError::NotFound => "NOT_FOUND",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let error_code = self.error_code().to_string();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(err: tokio::task::JoinError) -> Self {
        ServerError::Internal(format!("worker task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            ServerError::ModelNotLoaded("none".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let decode = EmbeddingError::Decode {
            path: "<upload>".into(),
            reason: "bad header".into(),
        };
        let err = ServerError::from(decode);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "INVALID_IMAGE");
        assert_eq!(
            ServerError::from(AnomalyError::NotFitted).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
