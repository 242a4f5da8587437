//! Workspace umbrella crate for MedGuard.
//!
//! Ties the embedding extractor and the anomaly models into one training
//! pipeline: labeled image directories go in, fitted model blobs, a label
//! table and JSON evaluation reports come out. The run is described by a
//! YAML file (see [`config`]) and driven by [`train`].

pub mod config;
pub mod dataset;
pub mod labels;
pub mod report;
pub mod train;

pub use anomaly::{
    AnomalyDetector, AnomalyError, AnomalyModel, AutoencoderConfig, ClusterConfig, DetectorConfig,
    DetectorMethod, EnsembleConfig, EnsembleVerdict, EvaluationReport, FitSummary, ModelVerdict,
    ThresholdSource, ValidationSet, calibrate, combine,
};
pub use embedding::{
    EmbeddingBatch, EmbeddingError, ExecutionContext, ExtractorConfig, FineTuneConfig, HEAD_FILE,
    ImageExtractor, Label,
};

pub use crate::config::{ConfigLoadError, MedguardConfig};
pub use crate::dataset::{DatasetSplit, LabeledImages};
pub use crate::labels::{render_labels, write_labels};
pub use crate::report::{ModelReport, TrainingReport};
pub use crate::train::train;

use std::error::Error;
use std::fmt;

/// Errors that can occur while running the training pipeline.
#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigLoadError),
    Embedding(EmbeddingError),
    Anomaly(AnomalyError),
    Io(std::io::Error),
    Report(serde_json::Error),
    /// The labeled image set cannot support the requested run.
    Dataset(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Config(err) => write!(f, "configuration failure: {err}"),
            PipelineError::Embedding(err) => write!(f, "embedding extraction failed: {err}"),
            PipelineError::Anomaly(err) => write!(f, "anomaly model failed: {err}"),
            PipelineError::Io(err) => write!(f, "i/o failure: {err}"),
            PipelineError::Report(err) => write!(f, "report serialization failed: {err}"),
            PipelineError::Dataset(msg) => write!(f, "dataset error: {msg}"),
        }
    }
}

impl Error for PipelineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PipelineError::Config(err) => Some(err),
            PipelineError::Embedding(err) => Some(err),
            PipelineError::Anomaly(err) => Some(err),
            PipelineError::Io(err) => Some(err),
            PipelineError::Report(err) => Some(err),
            PipelineError::Dataset(_) => None,
        }
    }
}

impl From<ConfigLoadError> for PipelineError {
    fn from(value: ConfigLoadError) -> Self {
        PipelineError::Config(value)
    }
}

impl From<EmbeddingError> for PipelineError {
    fn from(value: EmbeddingError) -> Self {
        PipelineError::Embedding(value)
    }
}

impl From<AnomalyError> for PipelineError {
    fn from(value: AnomalyError) -> Self {
        PipelineError::Anomaly(value)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(value: std::io::Error) -> Self {
        PipelineError::Io(value)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(value: serde_json::Error) -> Self {
        PipelineError::Report(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_stage() {
        let err = PipelineError::from(AnomalyError::NotFitted);
        assert!(err.to_string().starts_with("anomaly model failed"));
        assert!(err.source().is_some());
        assert!(PipelineError::Dataset("x".into()).source().is_none());
    }
}
