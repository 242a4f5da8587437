//! MedGuard Server - HTTP REST API for counterfeit medicine detection
//!
//! Serves the fitted anomaly models behind a small REST API. One uploaded
//! package photo is embedded by the CNN extractor, scored by every loaded
//! model and the per-model verdicts are merged into one decision.
//!
//! # Features
//!
//! - **Model registry**: extractor + model blobs loaded at startup, swapped
//!   whole on reload
//! - **Middleware**: Compression, CORS, request ID tracking, structured logging
//! - **Configuration**: `server.toml`, `.env` and `MEDGUARD_SERVER__*` variables
//! - **Error Handling**: `{ "error": { "code", "message" } }` bodies
//! - **Graceful Shutdown**: SIGTERM and Ctrl+C
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use server::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::load()?;
//!     server::start_server(config).await?;
//!     Ok(())
//! }
//! ```
//!
//! # API Endpoints
//!
//! - `GET /` - API information
//! - `GET /health` - Liveness probe with loaded-model report
//! - `GET /ready` - Readiness probe, 503 until models are loaded
//! - `POST /predict` - Multipart upload (`file`) to verdict
//! - `POST /api/v1/models/reload` - Reload models from disk

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::{build_router, start_server};
pub use state::{LoadedModels, ModelRegistry, ServerState};
