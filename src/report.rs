//! JSON reports written by a training run.

use std::fs;
use std::path::{Path, PathBuf};

use anomaly::{ClassificationMetrics, DetectorMethod, EvaluationReport, FitSummary};
use chrono::{DateTime, Utc};
use embedding::FineTuneReport;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::PipelineError;

/// Image counts per split and class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCounts {
    pub train_genuine: usize,
    pub train_counterfeit: usize,
    pub validation_genuine: usize,
    pub validation_counterfeit: usize,
}

/// Fit and evaluation outcome of one anomaly model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    pub fit: FitSummary,
    /// Evaluation on the validation split, or on the fit set when there is
    /// no validation data.
    pub evaluation: EvaluationReport,
    pub model_path: PathBuf,
}

/// Combined verdicts of all fitted models on the validation split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleEvaluation {
    pub models: Vec<DetectorMethod>,
    pub flagged: usize,
    pub low_confidence: usize,
    pub classification: ClassificationMetrics,
}

/// Everything one `train` run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub extractor_version: String,
    pub samples: SampleCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fine_tune: Option<FineTuneReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_path: Option<PathBuf>,
    pub models: Vec<ModelReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensemble: Option<EnsembleEvaluation>,
}

impl TrainingReport {
    pub fn model(&self, method: DetectorMethod) -> Option<&ModelReport> {
        self.models.iter().find(|m| m.fit.method == method)
    }
}

/// File name of the per-model evaluation report.
pub fn evaluation_file_name(method: DetectorMethod) -> String {
    format!("{method}_evaluation.json")
}

pub const TRAINING_REPORT_FILE: &str = "training_report.json";

/// Pretty-printed JSON, parent directories created as needed.
pub fn write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<(), PipelineError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(path, body)?;
    debug!(path = %path.display(), "report written");
    Ok(())
}

pub fn read_training_report(path: impl AsRef<Path>) -> Result<TrainingReport, PipelineError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_file_names() {
        assert_eq!(evaluation_file_name(DetectorMethod::Kmeans), "kmeans_evaluation.json");
        assert_eq!(
            evaluation_file_name(DetectorMethod::Autoencoder),
            "autoencoder_evaluation.json"
        );
    }

    #[test]
    fn json_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(TRAINING_REPORT_FILE);
        let now = Utc::now();
        let report = TrainingReport {
            started_at: now,
            finished_at: now,
            extractor_version: "resnet18/224/full/raw/trunk".into(),
            samples: SampleCounts {
                train_genuine: 8,
                ..Default::default()
            },
            fine_tune: None,
            head_path: None,
            models: Vec::new(),
            ensemble: None,
        };
        write_json(&path, &report).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("fine_tune"));
        assert_eq!(read_training_report(&path).unwrap(), report);
        assert!(report.model(DetectorMethod::Kmeans).is_none());
    }
}
