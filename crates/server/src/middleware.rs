use anomaly::EnsembleVerdict;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id for one request, stored in the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Outcome of a `/predict` call, attached to the response extensions so the
/// access log can name the models that voted.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionOutcome {
    pub models: Vec<String>,
    pub is_fake: bool,
    pub confidence: f32,
    pub low_confidence: bool,
}

impl PredictionOutcome {
    pub fn from_verdict(verdict: &EnsembleVerdict) -> Self {
        Self {
            models: verdict.model_details.keys().cloned().collect(),
            is_fake: verdict.is_fake,
            confidence: verdict.confidence,
            low_confidence: verdict.warning.is_some(),
        }
    }
}

/// Tags every request with an id.
///
/// A non-empty caller-supplied `x-request-id` is kept; otherwise a UUID is
/// minted. The id is echoed on the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// One access-log line per request. Predictions also carry the models that
/// answered and the combined verdict.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let start = Instant::now();

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    match response.extensions().get::<PredictionOutcome>() {
        Some(outcome) => tracing::info!(
            %method,
            %path,
            status,
            duration_ms,
            %request_id,
            models = %outcome.models.join(","),
            is_fake = outcome.is_fake,
            confidence = outcome.confidence,
            low_confidence = outcome.low_confidence,
            "prediction served"
        ),
        None if status >= 500 => tracing::warn!(
            %method,
            %path,
            status,
            duration_ms,
            %request_id,
            "request failed"
        ),
        None => tracing::info!(%method, %path, status, duration_ms, %request_id, "request handled"),
    }
    response
}
