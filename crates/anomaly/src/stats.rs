//! Small numeric helpers shared by the models.

use crate::AnomalyError;

pub(crate) fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub(crate) fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    squared_euclidean(a, b).sqrt()
}

/// Mean and population standard deviation, accumulated in `f64`.
pub(crate) fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|v| f64::from(*v)).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|v| (f64::from(*v) - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean as f32, var.sqrt() as f32)
}

/// `1 / (1 + exp(score - threshold))`: high for scores well under the threshold.
pub(crate) fn genuine_probability(score: f32, threshold: f32) -> f32 {
    let z = f64::from(score) - f64::from(threshold);
    (1.0 / (1.0 + z.exp())) as f32
}

/// Non-empty, rectangular, and (when given) of the expected width. Returns the width.
pub(crate) fn check_matrix(x: &[Vec<f32>], expected_dim: Option<usize>) -> Result<usize, AnomalyError> {
    let Some(first) = x.first() else {
        return Err(AnomalyError::InvalidInput("no embeddings supplied".into()));
    };
    let dim = first.len();
    if dim == 0 {
        return Err(AnomalyError::InvalidInput("embeddings are empty vectors".into()));
    }
    if let Some(row) = x.iter().position(|row| row.len() != dim) {
        return Err(AnomalyError::InvalidInput(format!(
            "row {row} has {} dimensions, expected {dim}",
            x[row].len()
        )));
    }
    if let Some(expected) = expected_dim {
        if expected != dim {
            return Err(AnomalyError::InvalidInput(format!(
                "model expects {expected}-dimensional embeddings, got {dim}"
            )));
        }
    }
    Ok(dim)
}

pub(crate) fn check_finite(x: &[Vec<f32>]) -> Result<(), AnomalyError> {
    if x.iter().flatten().any(|v| !v.is_finite()) {
        return Err(AnomalyError::InvalidInput(
            "embeddings contain NaN or infinite values".into(),
        ));
    }
    Ok(())
}
