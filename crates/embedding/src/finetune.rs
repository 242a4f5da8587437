//! Triplet fine-tuning of the embedding head.
//!
//! Trunk features are computed once, so only the `D×D` head receives
//! gradients. Each step uses a shuffled batch as anchors, the same batch
//! rotated by one as positives, and negatives drawn from the whole pool.

use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backbone::EmbeddingHead;
use crate::{EmbeddingError, FineTuneConfig};

const DISTANCE_EPS: f64 = 1e-6;

/// Outcome of a fine-tuning run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FineTuneReport {
    pub samples: usize,
    pub epochs: usize,
    /// Mean triplet loss per epoch.
    pub epoch_losses: Vec<f32>,
}

impl FineTuneReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

fn pairwise_distance(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    (a - b)?.affine(1.0, DISTANCE_EPS)?.sqr()?.sum(1)?.sqrt()
}

/// `mean(max(0, d(a, p) - d(a, n) + margin))`.
pub(crate) fn triplet_margin_loss(
    anchor: &Tensor,
    positive: &Tensor,
    negative: &Tensor,
    margin: f32,
) -> candle_core::Result<Tensor> {
    let d_ap = pairwise_distance(anchor, positive)?;
    let d_an = pairwise_distance(anchor, negative)?;
    (d_ap - d_an)?
        .affine(1.0, f64::from(margin))?
        .relu()?
        .mean_all()
}

fn index_tensor(ids: &[usize], device: &Device) -> candle_core::Result<Tensor> {
    let ids: Vec<u32> = ids.iter().map(|&i| i as u32).collect();
    let len = ids.len();
    Tensor::from_vec(ids, len, device)
}

/// Train `head` in place on fixed trunk features.
pub(crate) fn train_head(
    features: &[Vec<f32>],
    head: &EmbeddingHead,
    cfg: &FineTuneConfig,
    device: &Device,
) -> Result<FineTuneReport, EmbeddingError> {
    let n = features.len();
    if n < 2 {
        return Err(EmbeddingError::Training(format!(
            "need at least two images, got {n}"
        )));
    }
    let dim = features[0].len();
    let flat: Vec<f32> = features.iter().flatten().copied().collect();
    let pool = Tensor::from_vec(flat, (n, dim), device)?;

    let params = ParamsAdamW {
        lr: cfg.learning_rate,
        ..Default::default()
    };
    let mut opt = AdamW::new(head.vars(), params)?;
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let mut order: Vec<usize> = (0..n).collect();
    let mut epoch_losses = Vec::with_capacity(cfg.epochs);

    for epoch in 1..=cfg.epochs {
        order.shuffle(&mut rng);
        let mut total = 0.0f32;
        let mut steps = 0usize;

        for anchors in order.chunks(cfg.batch_size) {
            // A singleton batch has no distinct positive.
            if anchors.len() < 2 {
                continue;
            }
            let mut positives = anchors.to_vec();
            positives.rotate_left(1);
            let negatives: Vec<usize> = anchors
                .iter()
                .map(|&a| {
                    let mut j = rng.gen_range(0..n);
                    while j == a {
                        j = rng.gen_range(0..n);
                    }
                    j
                })
                .collect();

            let a = head.forward(&pool.index_select(&index_tensor(anchors, device)?, 0)?)?;
            let p = head.forward(&pool.index_select(&index_tensor(&positives, device)?, 0)?)?;
            let neg = head.forward(&pool.index_select(&index_tensor(&negatives, device)?, 0)?)?;

            let loss = triplet_margin_loss(&a, &p, &neg, cfg.margin)?;
            let value = loss.to_scalar::<f32>()?;
            if !value.is_finite() {
                return Err(EmbeddingError::Training(format!(
                    "loss became {value} in epoch {epoch}"
                )));
            }
            opt.backward_step(&loss)?;
            total += value;
            steps += 1;
        }

        let mean = if steps == 0 { 0.0 } else { total / steps as f32 };
        debug!(epoch, loss = mean, "fine-tune epoch");
        epoch_losses.push(mean);
    }

    info!(
        samples = n,
        epochs = cfg.epochs,
        final_loss = epoch_losses.last().copied().unwrap_or_default(),
        "embedding head fine-tuned"
    );
    Ok(FineTuneReport {
        samples: n,
        epochs: cfg.epochs,
        epoch_losses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triplet_loss_is_zero_when_negative_far() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[0f32, 0.]], &device).unwrap();
        let p = Tensor::new(&[[0.1f32, 0.]], &device).unwrap();
        let n = Tensor::new(&[[10f32, 0.]], &device).unwrap();
        let loss = triplet_margin_loss(&a, &p, &n, 1.0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn triplet_loss_penalises_close_negative() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[0f32, 0.]], &device).unwrap();
        let p = Tensor::new(&[[1f32, 0.]], &device).unwrap();
        let n = Tensor::new(&[[0f32, 0.]], &device).unwrap();
        let loss = triplet_margin_loss(&a, &p, &n, 1.0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 2.0).abs() < 1e-3);
    }

    #[test]
    fn training_runs_and_records_each_epoch() {
        let device = Device::Cpu;
        let head = EmbeddingHead::identity(4, &device).unwrap();
        let features: Vec<Vec<f32>> = (0..6)
            .map(|i| vec![i as f32 * 0.1, 1.0, 0.5, -(i as f32) * 0.2])
            .collect();
        let cfg = FineTuneConfig {
            epochs: 3,
            batch_size: 4,
            ..Default::default()
        };
        let report = train_head(&features, &head, &cfg, &device).unwrap();
        assert_eq!(report.epoch_losses.len(), 3);
        assert!(report.final_loss().unwrap().is_finite());
    }

    #[test]
    fn training_needs_two_samples() {
        let device = Device::Cpu;
        let head = EmbeddingHead::identity(2, &device).unwrap();
        let err = train_head(&[vec![1.0, 2.0]], &head, &FineTuneConfig::default(), &device);
        assert!(matches!(err, Err(EmbeddingError::Training(_))));
    }
}
