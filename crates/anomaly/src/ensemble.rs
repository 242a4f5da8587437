//! Confidence-weighted vote across anomaly models.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{AnomalyError, EnsembleConfig};

/// Verdict from a single model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub is_fake: bool,
    /// Confidence in the verdict, in `[0, 1]`.
    pub confidence: f32,
}

impl ModelVerdict {
    /// The model's own decision, with confidence `max(p, 1 - p)` taken from
    /// its genuine-likeness `p`.
    pub fn new(is_fake: bool, p: f32) -> Self {
        let p = p.clamp(0.0, 1.0);
        Self {
            is_fake,
            confidence: p.max(1.0 - p),
        }
    }
}

/// Combined decision with the per-model breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleVerdict {
    pub is_fake: bool,
    /// Weighted fraction of "genuine" votes, in `[0, 1]`.
    pub confidence: f32,
    pub model_details: BTreeMap<String, ModelVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub const LOW_CONFIDENCE_WARNING: &str = "Low confidence prediction. Manual verification recommended.";

/// Weighted genuine share `Σ cᵢ·[genuineᵢ] / Σ cᵢ`, counterfeit iff below 0.5.
///
/// When every confidence is zero the unweighted share of genuine votes is
/// used. Aggregates strictly between `1 - τ` and `τ` carry a warning.
pub fn combine(
    results: &BTreeMap<String, ModelVerdict>,
    cfg: &EnsembleConfig,
) -> Result<EnsembleVerdict, AnomalyError> {
    cfg.validate()?;
    if results.is_empty() {
        return Err(AnomalyError::NoModels);
    }

    let mut weight_sum = 0.0f64;
    let mut genuine_sum = 0.0f64;
    for (name, verdict) in results {
        let c = f64::from(verdict.confidence);
        if !c.is_finite() || c < 0.0 {
            return Err(AnomalyError::InvalidInput(format!(
                "model '{name}' reported confidence {c}"
            )));
        }
        weight_sum += c;
        if !verdict.is_fake {
            genuine_sum += c;
        }
    }

    let aggregate = if weight_sum > 0.0 {
        (genuine_sum / weight_sum) as f32
    } else {
        let genuine = results.values().filter(|v| !v.is_fake).count();
        genuine as f32 / results.len() as f32
    };

    let tau = cfg.high_confidence_threshold;
    let warning = (aggregate > 1.0 - tau && aggregate < tau).then(|| LOW_CONFIDENCE_WARNING.to_string());
    debug!(aggregate, models = results.len(), low_confidence = warning.is_some(), "ensemble combined");

    Ok(EnsembleVerdict {
        is_fake: aggregate < 0.5,
        confidence: aggregate,
        model_details: results.clone(),
        warning,
    })
}
