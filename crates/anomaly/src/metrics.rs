//! Evaluation output: score summaries, histograms, clustering quality and
//! classification metrics at the fitted threshold.

use embedding::Label;
use serde::{Deserialize, Serialize};

use crate::stats::{euclidean, mean_std};
use crate::{AnomalyError, DetectorMethod};

/// Bins used for evaluation histograms.
pub const HISTOGRAM_BINS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreSummary {
    pub count: usize,
    pub mean: f32,
    pub std: f32,
    pub min: f32,
    pub max: f32,
}

impl ScoreSummary {
    pub fn from_scores(scores: &[f32]) -> Self {
        let (mean, std) = mean_std(scores);
        let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Self {
            count: scores.len(),
            mean,
            std,
            min: if scores.is_empty() { 0.0 } else { min },
            max: if scores.is_empty() { 0.0 } else { max },
        }
    }
}

/// Equal-width histogram of scores with the decision threshold marked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Histogram {
    /// `counts.len() + 1` bin edges.
    pub edges: Vec<f32>,
    pub counts: Vec<usize>,
    pub threshold: f32,
}

impl Histogram {
    pub fn build(scores: &[f32], bins: usize, threshold: f32) -> Self {
        let bins = bins.max(1);
        let summary = ScoreSummary::from_scores(scores);
        let lo = summary.min;
        let mut width = (summary.max - summary.min) / bins as f32;
        if !(width > 0.0) {
            width = 1.0 / bins as f32;
        }
        let edges = (0..=bins).map(|i| lo + width * i as f32).collect();
        let mut counts = vec![0usize; bins];
        for s in scores {
            let idx = (((s - lo) / width) as usize).min(bins - 1);
            counts[idx] += 1;
        }
        Self {
            edges,
            counts,
            threshold,
        }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// Binary classification metrics, counterfeit being the positive class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationMetrics {
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ClassificationMetrics {
    /// Zero denominators yield 0 rather than NaN.
    pub fn compute(flagged: &[bool], labels: &[Label]) -> Result<Self, AnomalyError> {
        if flagged.len() != labels.len() {
            return Err(AnomalyError::InvalidInput(format!(
                "{} predictions but {} labels",
                flagged.len(),
                labels.len()
            )));
        }
        let (mut tp, mut fp, mut tn, mut fneg) = (0, 0, 0, 0);
        for (pred, label) in flagged.iter().zip(labels) {
            match (*pred, label.is_counterfeit()) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fneg += 1,
            }
        }
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f32 / den as f32 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fneg);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Ok(Self {
            accuracy: ratio(tp + tn, flagged.len()),
            precision,
            recall,
            f1,
            true_positive: tp,
            false_positive: fp,
            true_negative: tn,
            false_negative: fneg,
        })
    }
}

/// Mean silhouette coefficient of a hard assignment.
///
/// `None` unless there are at least two samples and the number of populated
/// clusters lies in `2..=n-1`.
pub fn silhouette_score(x: &[Vec<f32>], assignment: &[usize]) -> Option<f32> {
    let n = x.len();
    if n < 2 || assignment.len() != n {
        return None;
    }
    let k = assignment.iter().copied().max()? + 1;
    let mut sizes = vec![0usize; k];
    for &c in assignment {
        sizes[c] += 1;
    }
    let populated = sizes.iter().filter(|s| **s > 0).count();
    if populated < 2 || populated > n - 1 {
        return None;
    }

    let mut total = 0.0f64;
    for i in 0..n {
        let own = assignment[i];
        if sizes[own] == 1 {
            continue;
        }
        let mut sums = vec![0.0f64; k];
        for j in 0..n {
            if i != j {
                sums[assignment[j]] += f64::from(euclidean(&x[i], &x[j]));
            }
        }
        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..k)
            .filter(|c| *c != own && sizes[*c] > 0)
            .map(|c| sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    Some((total / n as f64) as f32)
}

/// Everything `evaluate` reports for one model on one dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationReport {
    pub method: DetectorMethod,
    pub threshold: f32,
    /// Clustering quality; only meaningful for the k-means model.
    pub silhouette: Option<f32>,
    pub scores: ScoreSummary,
    pub histogram: Histogram,
    pub flagged: usize,
    pub classification: Option<ClassificationMetrics>,
}

impl EvaluationReport {
    pub(crate) fn build(
        method: DetectorMethod,
        threshold: f32,
        scores: &[f32],
        labels: Option<&[Label]>,
        silhouette: Option<f32>,
    ) -> Result<Self, AnomalyError> {
        let flagged: Vec<bool> = scores.iter().map(|s| *s > threshold).collect();
        let classification = labels
            .map(|labels| ClassificationMetrics::compute(&flagged, labels))
            .transpose()?;
        Ok(Self {
            method,
            threshold,
            silhouette,
            scores: ScoreSummary::from_scores(scores),
            histogram: Histogram::build(scores, HISTOGRAM_BINS, threshold),
            flagged: flagged.iter().filter(|f| **f).count(),
            classification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Label::{Counterfeit as C, Genuine as G};

    #[test]
    fn classification_counts() {
        let m = ClassificationMetrics::compute(&[true, true, false, false], &[C, G, G, C]).unwrap();
        assert_eq!(
            (m.true_positive, m.false_positive, m.true_negative, m.false_negative),
            (1, 1, 1, 1)
        );
        assert_eq!(m.accuracy, 0.5);
        assert_eq!(m.precision, 0.5);
        assert_eq!(m.recall, 0.5);
        assert!((m.f1 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn zero_division_yields_zero() {
        let m = ClassificationMetrics::compute(&[false, false], &[G, G]).unwrap();
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert_eq!(m.f1, 0.0);
        assert_eq!(m.accuracy, 1.0);
    }

    #[test]
    fn histogram_covers_all_scores() {
        let scores: Vec<f32> = (0..100).map(|i| i as f32 / 10.0).collect();
        let h = Histogram::build(&scores, HISTOGRAM_BINS, 5.0);
        assert_eq!(h.counts.len(), 50);
        assert_eq!(h.edges.len(), 51);
        assert_eq!(h.total(), 100);
        assert_eq!(h.threshold, 5.0);
    }

    #[test]
    fn histogram_of_constant_scores() {
        let h = Histogram::build(&[2.0; 5], 10, 2.0);
        assert_eq!(h.counts[0], 5);
    }

    #[test]
    fn silhouette_of_separated_clusters_is_high() {
        let x = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![10.0, 10.0],
            vec![10.1, 10.0],
        ];
        let s = silhouette_score(&x, &[0, 0, 1, 1]).unwrap();
        assert!(s > 0.9);
    }

    #[test]
    fn silhouette_degenerate_cases() {
        let x = vec![vec![0.0], vec![1.0], vec![2.0]];
        assert_eq!(silhouette_score(&x, &[0, 0, 0]), None);
        assert_eq!(silhouette_score(&x, &[0, 1, 2]), None);
        assert_eq!(silhouette_score(&x[..1], &[0]), None);
    }
}
