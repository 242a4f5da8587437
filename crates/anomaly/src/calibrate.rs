//! F1-optimal decision threshold from labeled validation scores.
//!
//! Counterfeit is the positive class. Every pair of adjacent distinct scores
//! defines an operating point "flag everything at or above the upper score";
//! its cutoff is the midpoint of the pair, so the strict `score > threshold`
//! rule used at prediction time reproduces that operating point exactly.

use embedding::Label;

use crate::AnomalyError;

const F1_EPS: f64 = 1e-10;

/// Select the threshold maximising F1 over `scores` (higher = more anomalous).
///
/// Ties go to the lowest cutoff. A single distinct score is returned as is.
pub fn calibrate(scores: &[f32], labels: &[Label]) -> Result<f32, AnomalyError> {
    if scores.is_empty() {
        return Err(AnomalyError::InvalidInput("no scores to calibrate on".into()));
    }
    if scores.len() != labels.len() {
        return Err(AnomalyError::InvalidInput(format!(
            "{} scores but {} labels",
            scores.len(),
            labels.len()
        )));
    }
    if scores.iter().any(|s| !s.is_finite()) {
        return Err(AnomalyError::InvalidInput(
            "scores contain NaN or infinite values".into(),
        ));
    }

    let mut pairs: Vec<(f32, bool)> = scores
        .iter()
        .zip(labels)
        .map(|(s, l)| (*s, l.is_counterfeit()))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total_pos = pairs.iter().filter(|(_, pos)| *pos).count();
    let total_neg = pairs.len() - total_pos;
    let (mut below_pos, mut below_neg) = (0usize, 0usize);
    let mut best: Option<(f64, f32)> = None;

    let mut i = 0;
    while i < pairs.len() {
        let lo = pairs[i].0;
        while i < pairs.len() && pairs[i].0 == lo {
            if pairs[i].1 {
                below_pos += 1;
            } else {
                below_neg += 1;
            }
            i += 1;
        }
        let Some(&(hi, _)) = pairs.get(i) else {
            break;
        };

        let tp = (total_pos - below_pos) as f64;
        let fp = (total_neg - below_neg) as f64;
        let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
        let recall = if total_pos > 0 { tp / total_pos as f64 } else { 0.0 };
        let f1 = 2.0 * precision * recall / (precision + recall + F1_EPS);

        if best.map_or(true, |(best_f1, _)| f1 > best_f1) {
            best = Some((f1, midpoint(lo, hi)));
        }
    }

    Ok(best.map_or(pairs[0].0, |(_, cutoff)| cutoff))
}

/// A value `t` with `lo <= t < hi`.
fn midpoint(lo: f32, hi: f32) -> f32 {
    let mid = lo + (hi - lo) * 0.5;
    if mid < hi {
        mid
    } else {
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Label::{Counterfeit as C, Genuine as G};

    #[test]
    fn perfectly_separable_scores() {
        let scores = [0.1, 0.2, 0.3, 0.8, 0.9];
        let labels = [G, G, G, C, C];
        let t = calibrate(&scores, &labels).unwrap();
        assert!((t - 0.55).abs() < 1e-6);
        let predicted: Vec<bool> = scores.iter().map(|s| *s > t).collect();
        assert_eq!(predicted, vec![false, false, false, true, true]);
    }

    #[test]
    fn calibration_is_idempotent() {
        let scores = [0.4, 0.1, 0.7, 0.2, 0.9, 0.3, 0.65];
        let labels = [C, G, C, G, C, C, G];
        let a = calibrate(&scores, &labels).unwrap();
        let b = calibrate(&scores, &labels).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn single_distinct_score_is_returned() {
        let t = calibrate(&[0.42, 0.42, 0.42], &[G, C, G]).unwrap();
        assert_eq!(t, 0.42);
    }

    #[test]
    fn all_genuine_does_not_divide_by_zero() {
        let t = calibrate(&[0.1, 0.2, 0.3], &[G, G, G]).unwrap();
        assert!(t.is_finite());
        assert!(t > 0.1 && t < 0.3);
    }

    #[test]
    fn threshold_lies_strictly_inside_score_range() {
        let scores = [1.0, 5.0, 2.0, 4.0, 3.0, 2.5];
        let labels = [G, C, C, G, C, G];
        let t = calibrate(&scores, &labels).unwrap();
        assert!(t > 1.0 && t < 5.0);
    }

    #[test]
    fn first_maximum_wins() {
        // Cutoffs 1.5 and 4.5 both reach F1 = 2/3; the lower one is kept.
        let scores = [1.0, 2.0, 3.0, 4.0, 5.0];
        let labels = [G, C, G, G, C];
        let t = calibrate(&scores, &labels).unwrap();
        assert!((t - 1.5).abs() < 1e-6);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(calibrate(&[], &[]), Err(AnomalyError::InvalidInput(_))));
        assert!(matches!(
            calibrate(&[0.1, 0.2], &[G]),
            Err(AnomalyError::InvalidInput(_))
        ));
        assert!(calibrate(&[f32::NAN], &[G]).is_err());
    }
}
