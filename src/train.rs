//! End-to-end training run: discover, split, embed, fit, evaluate, persist.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anomaly::{
    AnomalyDetector, AnomalyModel, ClassificationMetrics, DetectorMethod, EnsembleConfig,
    ModelVerdict, ValidationSet, combine,
};
use chrono::Utc;
use embedding::{EmbeddingBatch, HEAD_FILE, ImageExtractor};
use tracing::{info, warn};

use crate::config::MedguardConfig;
use crate::dataset::LabeledImages;
use crate::labels::write_labels;
use crate::report::{
    EnsembleEvaluation, ModelReport, SampleCounts, TRAINING_REPORT_FILE, TrainingReport,
    evaluation_file_name, write_json,
};
use crate::PipelineError;

/// Run a full training pass as described by `config`.
///
/// Writes the label table, one blob per fitted model, the fine-tuned head
/// when fine-tuning is configured, per-model evaluation reports and the
/// overall training report.
pub fn train(config: &MedguardConfig) -> Result<TrainingReport, PipelineError> {
    config.validate()?;
    let started_at = Utc::now();

    let images = LabeledImages::discover(&config.data.genuine_dir, &config.data.counterfeit_dir)?;
    write_labels(&config.output.labels_csv, &images)?;
    let split = images.split(config.data.val_fraction, config.data.seed)?;

    let mut extractor = ImageExtractor::new(config.extractor.clone())?;

    let mut fine_tune = None;
    let mut head_path = None;
    if let Some(ft) = &config.fine_tune {
        let report = extractor.fine_tune(&split.train.genuine, ft)?;
        info!(
            epochs = report.epochs,
            final_loss = report.final_loss(),
            "embedding head fine-tuned"
        );
        let path = config.output.model_dir.join(HEAD_FILE);
        extractor.save_head(&path)?;
        fine_tune = Some(report);
        head_path = Some(path);
    }
    let extractor_version = extractor.version();

    let train_batch = split.train.embed(&extractor)?;
    let validation = if split.validation.is_empty() {
        warn!("validation split is empty; thresholds use training statistics");
        None
    } else {
        Some(split.validation.embed(&extractor)?)
    };
    let samples = count_samples(&train_batch, validation.as_ref());

    let fit_set = if config.data.train_on_genuine_only {
        genuine_only(&train_batch)
    } else {
        train_batch
    };
    if fit_set.is_empty() {
        return Err(PipelineError::Dataset(
            "no training embeddings left to fit on".to_string(),
        ));
    }

    let mut models = Vec::with_capacity(config.detectors.len());
    let mut verdicts = BTreeMap::new();
    for &method in &config.detectors {
        let mut detector =
            AnomalyDetector::new(&config.detector_config(method), extractor.context())?;
        let fit = detector.fit(
            fit_set.embeddings(),
            validation.as_ref().and_then(ValidationSet::from_batch),
        )?;
        detector.set_extractor_version(Some(extractor_version.clone()));

        let evaluation = match &validation {
            Some(val) => detector.evaluate(val.embeddings(), val.labels())?,
            None => detector.evaluate(fit_set.embeddings(), fit_set.labels())?,
        };
        if let Some(val) = &validation {
            verdicts.insert(method, detector.verdicts(val.embeddings())?);
        }

        let model_path = config.output.model_dir.join(method.file_name());
        detector.save(&model_path)?;
        write_json(
            config.output.report_dir.join(evaluation_file_name(method)),
            &evaluation,
        )?;
        info!(
            %method,
            threshold = fit.threshold,
            source = fit.threshold_source.as_str(),
            path = %model_path.display(),
            "model saved"
        );
        models.push(ModelReport {
            fit,
            evaluation,
            model_path,
        });
    }

    let ensemble = match &validation {
        Some(val) => evaluate_ensemble(&verdicts, val, &config.ensemble)?,
        None => None,
    };

    let report = TrainingReport {
        started_at,
        finished_at: Utc::now(),
        extractor_version,
        samples,
        fine_tune,
        head_path,
        models,
        ensemble,
    };
    write_json(config.output.report_dir.join(TRAINING_REPORT_FILE), &report)?;
    info!(models = report.models.len(), "training finished");
    Ok(report)
}

fn genuine_only(batch: &EmbeddingBatch) -> EmbeddingBatch {
    let indices: Vec<usize> = match batch.labels() {
        Some(labels) => labels
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.is_counterfeit())
            .map(|(i, _)| i)
            .collect(),
        None => (0..batch.len()).collect(),
    };
    batch.select(&indices)
}

fn count_samples(train: &EmbeddingBatch, validation: Option<&EmbeddingBatch>) -> SampleCounts {
    let split = |batch: Option<&EmbeddingBatch>| {
        let labels = batch.and_then(EmbeddingBatch::labels).unwrap_or(&[]);
        let counterfeit = labels.iter().filter(|l| l.is_counterfeit()).count();
        (labels.len() - counterfeit, counterfeit)
    };
    let (train_genuine, train_counterfeit) = split(Some(train));
    let (validation_genuine, validation_counterfeit) = split(validation);
    SampleCounts {
        train_genuine,
        train_counterfeit,
        validation_genuine,
        validation_counterfeit,
    }
}

/// Combine every model's verdict per validation image.
fn evaluate_ensemble(
    per_model: &BTreeMap<DetectorMethod, Vec<ModelVerdict>>,
    validation: &EmbeddingBatch,
    cfg: &EnsembleConfig,
) -> Result<Option<EnsembleEvaluation>, PipelineError> {
    let Some(labels) = validation.labels() else {
        return Ok(None);
    };
    if per_model.is_empty() {
        return Ok(None);
    }

    let mut flagged = Vec::with_capacity(labels.len());
    let mut low_confidence = 0;
    for i in 0..labels.len() {
        let votes: BTreeMap<String, ModelVerdict> = per_model
            .iter()
            .map(|(method, verdicts)| (method.to_string(), verdicts[i]))
            .collect();
        let verdict = combine(&votes, cfg)?;
        if verdict.warning.is_some() {
            low_confidence += 1;
        }
        flagged.push(verdict.is_fake);
    }
    let classification = ClassificationMetrics::compute(&flagged, labels)?;
    Ok(Some(EnsembleEvaluation {
        models: per_model.keys().copied().collect(),
        flagged: flagged.iter().filter(|f| **f).count(),
        low_confidence,
        classification,
    }))
}

/// Paths a finished run leaves behind, derived from its configuration.
pub fn model_paths(config: &MedguardConfig) -> Vec<(DetectorMethod, PathBuf)> {
    config
        .detectors
        .iter()
        .map(|&m| (m, config.output.model_dir.join(m.file_name())))
        .collect()
}
