//! MedGuard anomaly detection
//!
//! Scores image embeddings for how far they sit from the notion of
//! "genuine" learned at fit time. Two interchangeable models ship here:
//!
//! - **k-means** (`DetectorMethod::Kmeans`) - distance to the nearest of K
//!   centroids.
//! - **autoencoder** (`DetectorMethod::Autoencoder`) - mean squared
//!   reconstruction error of a small dense autoencoder.
//!
//! Both set a single threshold at fit time, either F1-optimal on labeled
//! validation scores or `mean + 2σ` of the training scores, and flag a
//! sample as counterfeit when its score exceeds it. `predict_proba` maps the
//! score to a genuine-likeness in `(0, 1)` that crosses 0.5 at the threshold.
//!
//! ## Quick example
//!
//! ```no_run
//! use anomaly::{AnomalyDetector, AnomalyModel, DetectorConfig, DetectorMethod};
//! use embedding::ExecutionContext;
//!
//! let ctx = ExecutionContext::cpu();
//! let mut detector =
//!     AnomalyDetector::new(&DetectorConfig::for_method(DetectorMethod::Kmeans), &ctx).unwrap();
//! let train: Vec<Vec<f32>> = (0..30).map(|i| vec![i as f32 % 3.0, 1.0]).collect();
//! detector.fit(&train, None).unwrap();
//! let flagged = detector.predict(&[vec![40.0, -5.0]]).unwrap();
//! assert_eq!(flagged, vec![true]);
//! ```
//!
//! Several models are merged into one verdict with [`ensemble::combine`].

pub mod calibrate;
pub mod config;
pub mod detector;
pub mod ensemble;
pub mod error;
pub mod metrics;
pub mod persist;

mod autoencoder;
mod cluster;
mod stats;

pub use crate::autoencoder::AutoencoderDetector;
pub use crate::calibrate::calibrate;
pub use crate::cluster::KMeansDetector;
pub use crate::config::{
    AutoencoderConfig, ClusterConfig, DetectorConfig, DetectorMethod, EnsembleConfig,
};
pub use crate::detector::{AnomalyDetector, AnomalyModel, FitSummary, ThresholdSource, ValidationSet};
pub use crate::ensemble::{combine, EnsembleVerdict, ModelVerdict};
pub use crate::error::AnomalyError;
pub use crate::metrics::{ClassificationMetrics, EvaluationReport, Histogram, ScoreSummary};
pub use crate::persist::BlobHeader;
