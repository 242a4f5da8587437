use embedding::{EmbeddingBatch, ExecutionContext, Label};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::autoencoder::AutoencoderDetector;
use crate::cluster::KMeansDetector;
use crate::ensemble::ModelVerdict;
use crate::metrics::EvaluationReport;
use crate::stats::genuine_probability;
use crate::{persist, AnomalyError, DetectorConfig, DetectorMethod};

/// Labeled embeddings used to calibrate the decision threshold.
#[derive(Debug, Clone, Copy)]
pub struct ValidationSet<'a> {
    pub embeddings: &'a [Vec<f32>],
    pub labels: &'a [Label],
}

impl<'a> ValidationSet<'a> {
    pub fn new(embeddings: &'a [Vec<f32>], labels: &'a [Label]) -> Result<Self, AnomalyError> {
        if embeddings.len() != labels.len() {
            return Err(AnomalyError::InvalidInput(format!(
                "{} validation embeddings but {} labels",
                embeddings.len(),
                labels.len()
            )));
        }
        Ok(Self { embeddings, labels })
    }

    /// Calibration needs at least one genuine and one counterfeit label.
    pub fn has_both_classes(&self) -> bool {
        let counterfeit = self.labels.iter().filter(|l| l.is_counterfeit()).count();
        counterfeit > 0 && counterfeit < self.labels.len()
    }

    /// `None` when the batch carries no labels.
    pub fn from_batch(batch: &'a EmbeddingBatch) -> Option<Self> {
        batch.labels().map(|labels| Self {
            embeddings: batch.embeddings(),
            labels,
        })
    }
}

/// Where a fitted threshold came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdSource {
    /// F1-optimal cutoff on labeled validation scores.
    Validation,
    /// `mean + k·std` of the training scores.
    Sigma,
}

impl ThresholdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdSource::Validation => "validation",
            ThresholdSource::Sigma => "sigma",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FitSummary {
    pub method: DetectorMethod,
    pub samples: usize,
    pub threshold: f32,
    pub threshold_source: ThresholdSource,
    /// Lloyd iterations or training epochs actually run.
    pub iterations: usize,
    /// Mean loss of the last epoch, for trained models.
    pub final_loss: Option<f32>,
}

/// Common contract of the anomaly models.
///
/// Scores grow with abnormality. `fit` replaces any previous fitted state
/// wholesale and leaves it untouched on failure.
pub trait AnomalyModel: Send + Sync {
    fn method(&self) -> DetectorMethod;

    fn is_fitted(&self) -> bool;

    fn threshold(&self) -> Option<f32>;

    /// Anomaly score per embedding.
    fn scores(&self, x: &[Vec<f32>]) -> Result<Vec<f32>, AnomalyError>;

    fn fit(
        &mut self,
        x: &[Vec<f32>],
        validation: Option<ValidationSet<'_>>,
    ) -> Result<FitSummary, AnomalyError>;

    fn evaluate(&self, x: &[Vec<f32>], labels: Option<&[Label]>) -> Result<EvaluationReport, AnomalyError>;

    /// Compressed, versioned blob; fails on an unfitted model.
    fn to_bytes(&self) -> Result<Vec<u8>, AnomalyError>;

    /// Version of the extractor whose embeddings the model was fitted on.
    fn extractor_version(&self) -> Option<&str>;

    fn set_extractor_version(&mut self, version: Option<String>);

    /// `true` marks a sample as counterfeit: `score > threshold`.
    fn predict(&self, x: &[Vec<f32>]) -> Result<Vec<bool>, AnomalyError> {
        let threshold = self.threshold().ok_or(AnomalyError::NotFitted)?;
        Ok(self.scores(x)?.into_iter().map(|s| s > threshold).collect())
    }

    /// Genuine-likeness `1 / (1 + exp(score - threshold))`.
    ///
    /// Non-increasing in the score, exactly 0.5 at the threshold. Not a
    /// calibrated probability.
    fn predict_proba(&self, x: &[Vec<f32>]) -> Result<Vec<f32>, AnomalyError> {
        let threshold = self.threshold().ok_or(AnomalyError::NotFitted)?;
        Ok(self
            .scores(x)?
            .into_iter()
            .map(|s| genuine_probability(s, threshold))
            .collect())
    }

    /// Per-sample verdicts for the ensemble. `is_fake` matches [`predict`]
    /// exactly, including scores too close to the threshold for the
    /// probability to leave 0.5.
    ///
    /// [`predict`]: AnomalyModel::predict
    fn verdicts(&self, x: &[Vec<f32>]) -> Result<Vec<ModelVerdict>, AnomalyError> {
        let threshold = self.threshold().ok_or(AnomalyError::NotFitted)?;
        Ok(self
            .scores(x)?
            .into_iter()
            .map(|s| ModelVerdict::new(s > threshold, genuine_probability(s, threshold)))
            .collect())
    }
}

/// One of the two anomaly models, chosen at construction.
#[derive(Debug)]
pub enum AnomalyDetector {
    Kmeans(KMeansDetector),
    Autoencoder(AutoencoderDetector),
}

impl AnomalyDetector {
    pub fn new(cfg: &DetectorConfig, ctx: &ExecutionContext) -> Result<Self, AnomalyError> {
        cfg.validate()?;
        Ok(match cfg.method {
            DetectorMethod::Kmeans => Self::Kmeans(KMeansDetector::new(cfg.cluster.clone())?),
            DetectorMethod::Autoencoder => Self::Autoencoder(AutoencoderDetector::new(
                cfg.autoencoder.clone(),
                ctx.clone(),
            )?),
        })
    }

    /// Default-configured detector for `"kmeans"` or `"autoencoder"`.
    pub fn from_tag(tag: &str, ctx: &ExecutionContext) -> Result<Self, AnomalyError> {
        let method: DetectorMethod = tag.parse()?;
        Self::new(&DetectorConfig::for_method(method), ctx)
    }

    /// Restore a model written by [`AnomalyModel::to_bytes`].
    pub fn from_bytes(
        method: DetectorMethod,
        bytes: &[u8],
        ctx: &ExecutionContext,
    ) -> Result<Self, AnomalyError> {
        Ok(match method {
            DetectorMethod::Kmeans => Self::Kmeans(KMeansDetector::from_blob(bytes)?),
            DetectorMethod::Autoencoder => {
                Self::Autoencoder(AutoencoderDetector::from_blob(bytes, ctx.clone())?)
            }
        })
    }

    /// Load a persisted model; the method is read from the blob header.
    pub fn load(path: impl AsRef<Path>, ctx: &ExecutionContext) -> Result<Self, AnomalyError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| {
            AnomalyError::Persistence(format!("cannot read {}: {e}", path.display()))
        })?;
        let header = persist::read_header(&bytes)?;
        let detector = Self::from_bytes(header.method, &bytes, ctx)?;
        info!(path = %path.display(), method = %header.method, "detector loaded");
        Ok(detector)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AnomalyError> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, bytes)?;
        info!(path = %path.display(), method = %self.method(), "detector saved");
        Ok(())
    }

    fn model(&self) -> &dyn AnomalyModel {
        match self {
            Self::Kmeans(m) => m,
            Self::Autoencoder(m) => m,
        }
    }

    fn model_mut(&mut self) -> &mut dyn AnomalyModel {
        match self {
            Self::Kmeans(m) => m,
            Self::Autoencoder(m) => m,
        }
    }
}

impl AnomalyModel for AnomalyDetector {
    fn method(&self) -> DetectorMethod {
        self.model().method()
    }

    fn is_fitted(&self) -> bool {
        self.model().is_fitted()
    }

    fn threshold(&self) -> Option<f32> {
        self.model().threshold()
    }

    fn scores(&self, x: &[Vec<f32>]) -> Result<Vec<f32>, AnomalyError> {
        self.model().scores(x)
    }

    fn fit(
        &mut self,
        x: &[Vec<f32>],
        validation: Option<ValidationSet<'_>>,
    ) -> Result<FitSummary, AnomalyError> {
        self.model_mut().fit(x, validation)
    }

    fn evaluate(&self, x: &[Vec<f32>], labels: Option<&[Label]>) -> Result<EvaluationReport, AnomalyError> {
        self.model().evaluate(x, labels)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, AnomalyError> {
        self.model().to_bytes()
    }

    fn extractor_version(&self) -> Option<&str> {
        self.model().extractor_version()
    }

    fn set_extractor_version(&mut self, version: Option<String>) {
        self.model_mut().set_extractor_version(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_tag_builds_each_method() {
        let ctx = ExecutionContext::cpu();
        for method in DetectorMethod::ALL {
            let detector = AnomalyDetector::from_tag(method.as_str(), &ctx).unwrap();
            assert_eq!(detector.method(), method);
            assert!(!detector.is_fitted());
            assert_eq!(detector.threshold(), None);
        }
    }

    #[test]
    fn unknown_tag_fails_at_construction() {
        let err = AnomalyDetector::from_tag("lof", &ExecutionContext::cpu()).unwrap_err();
        assert!(matches!(err, AnomalyError::Config(_)));
    }

    #[test]
    fn validation_set_checks_lengths() {
        let x = vec![vec![0.0]];
        assert!(ValidationSet::new(&x, &[]).is_err());
        assert!(ValidationSet::new(&x, &[Label::Genuine]).is_ok());
    }

    /// Fixed scores against a fixed threshold.
    struct Scripted {
        threshold: f32,
        scores: Vec<f32>,
    }

    impl AnomalyModel for Scripted {
        fn method(&self) -> DetectorMethod {
            DetectorMethod::Autoencoder
        }

        fn is_fitted(&self) -> bool {
            true
        }

        fn threshold(&self) -> Option<f32> {
            Some(self.threshold)
        }

        fn scores(&self, _x: &[Vec<f32>]) -> Result<Vec<f32>, AnomalyError> {
            Ok(self.scores.clone())
        }

        fn fit(
            &mut self,
            _x: &[Vec<f32>],
            _validation: Option<ValidationSet<'_>>,
        ) -> Result<FitSummary, AnomalyError> {
            Err(AnomalyError::NotFitted)
        }

        fn evaluate(
            &self,
            _x: &[Vec<f32>],
            _labels: Option<&[Label]>,
        ) -> Result<EvaluationReport, AnomalyError> {
            Err(AnomalyError::NotFitted)
        }

        fn to_bytes(&self) -> Result<Vec<u8>, AnomalyError> {
            Err(AnomalyError::NotFitted)
        }

        fn extractor_version(&self) -> Option<&str> {
            None
        }

        fn set_extractor_version(&mut self, _version: Option<String>) {}
    }

    #[test]
    fn verdicts_agree_with_predict_next_to_the_threshold() {
        let threshold = 1e-3_f32;
        let just_above = f32::from_bits(threshold.to_bits() + 1);
        let model = Scripted {
            threshold,
            scores: vec![just_above, threshold, 0.0, 5.0],
        };
        let x = vec![vec![0.0]; 4];

        // Too close for the genuine-likeness to move off 0.5.
        assert_eq!(model.predict_proba(&x).unwrap()[0], 0.5);

        let flagged = model.predict(&x).unwrap();
        assert_eq!(flagged, vec![true, false, false, true]);
        let verdicts = model.verdicts(&x).unwrap();
        let is_fake: Vec<bool> = verdicts.iter().map(|v| v.is_fake).collect();
        assert_eq!(is_fake, flagged);
        assert!(verdicts.iter().all(|v| (0.5..=1.0).contains(&v.confidence)));
    }

    #[test]
    fn unfitted_detector_cannot_be_serialized() {
        let detector = AnomalyDetector::from_tag("kmeans", &ExecutionContext::cpu()).unwrap();
        assert!(matches!(detector.to_bytes(), Err(AnomalyError::NotFitted)));
    }
}
