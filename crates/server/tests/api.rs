//! Router-level tests driven through `tower::ServiceExt::oneshot`.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use anomaly::{AnomalyDetector, AnomalyModel, DetectorConfig, DetectorMethod};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use embedding::{ExtractorConfig, ImageExtractor};
use http_body_util::BodyExt;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use server::{build_router, ModelRegistry, ServerConfig, ServerState};
use tower::ServiceExt;

const BOUNDARY: &str = "medguard-test-boundary";

fn extractor_config() -> ExtractorConfig {
    ExtractorConfig::default()
        .with_weights(None)
        .with_image_size(32)
}

fn package_png(shade: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(40, 40, |x, y| {
        Rgb([shade, (x * 6) as u8, (y * 6) as u8])
    });
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Extractor plus a k-means model fitted on a handful of synthetic photos.
fn fitted_parts() -> (ImageExtractor, AnomalyDetector) {
    let extractor = ImageExtractor::new(extractor_config()).unwrap();
    let train: Vec<Vec<f32>> = (0..8u8)
        .map(|i| extractor.extract_image_bytes(&package_png(100 + i * 5)).unwrap())
        .collect();
    let mut detector = AnomalyDetector::new(
        &DetectorConfig::for_method(DetectorMethod::Kmeans),
        extractor.context(),
    )
    .unwrap();
    detector.fit(&train, None).unwrap();
    detector.set_extractor_version(Some(extractor.version()));
    (extractor, detector)
}

fn config_in(dir: &Path) -> ServerConfig {
    ServerConfig {
        model_dir: dir.to_path_buf(),
        extractor: extractor_config(),
        ..Default::default()
    }
}

fn router(registry: ModelRegistry) -> Router {
    let state = ServerState::with_registry(config_in(Path::new("unused-models")), registry);
    build_router(Arc::new(state))
}

fn multipart(field: &str, bytes: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"pack.png\"\r\nContent-Type: image/png\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_loaded_models() {
    let (extractor, detector) = fitted_parts();
    let app = router(ModelRegistry::from_parts(Some(extractor), vec![detector]));

    let (status, body) = send(app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["models_loaded"]["kmeans"], true);
    assert_eq!(body["models_loaded"]["autoencoder"], false);
    assert_eq!(body["extractor_loaded"], true);
}

#[tokio::test]
async fn predict_returns_ensemble_verdict() {
    let (extractor, detector) = fitted_parts();
    let app = router(ModelRegistry::from_parts(Some(extractor), vec![detector]));

    let (status, body) = send(app, multipart("file", &package_png(110))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["is_fake"].is_boolean());
    let confidence = body["confidence"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&confidence));
    let kmeans = &body["model_details"]["kmeans"];
    assert!(kmeans["is_fake"].is_boolean());
    assert!(kmeans["confidence"].as_f64().unwrap() >= 0.5);
    // A single model yields a unanimous vote.
    assert_eq!(body["is_fake"], kmeans["is_fake"]);
}

#[tokio::test]
async fn predict_without_models_is_unavailable() {
    let app = router(ModelRegistry::empty());
    let (status, body) = send(app, multipart("file", &package_png(110))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "MODEL_NOT_LOADED");

    let app = router(ModelRegistry::empty());
    let (status, _) = send(app, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn undecodable_upload_is_bad_request() {
    let (extractor, detector) = fitted_parts();
    let app = router(ModelRegistry::from_parts(Some(extractor), vec![detector]));
    let (status, body) = send(app, multipart("file", b"definitely not a png")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_IMAGE");
}

#[tokio::test]
async fn missing_file_field_is_bad_request() {
    let (extractor, detector) = fitted_parts();
    let app = router(ModelRegistry::from_parts(Some(extractor), vec![detector]));
    let (status, body) = send(app, multipart("photo", &package_png(110))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn reload_picks_up_saved_models() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(ServerState::with_registry(
        config_in(dir.path()),
        ModelRegistry::empty(),
    ));
    let app = build_router(Arc::clone(&state));

    let (_, detector) = fitted_parts();
    detector
        .save(dir.path().join(DetectorMethod::Kmeans.file_name()))
        .unwrap();

    let reload = Request::builder()
        .method("POST")
        .uri("/api/v1/models/reload")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app.clone(), reload).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["models_loaded"]["kmeans"], true);
    assert_eq!(body["extractor_loaded"], true);

    let (status, body) = send(app, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert!(state.registry().is_loaded(DetectorMethod::Kmeans));
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = router(ModelRegistry::empty());
    let request = Request::builder()
        .uri("/")
        .header("x-request-id", "abc-123")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "abc-123");
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let app = router(ModelRegistry::empty());
    let (status, body) = send(app, get("/api/v1/nothing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}
