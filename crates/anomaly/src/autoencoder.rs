//! Reconstruction-error anomaly model.
//!
//! A symmetric dense autoencoder (`D → 256 → 128 → 64 → 128 → 256 → D` by
//! default) is trained to reproduce genuine embeddings; the anomaly score is
//! the per-sample mean squared reconstruction error.
//!
//! Hidden blocks are `Linear → BatchNorm → ReLU → Dropout`. Batch statistics
//! and dropout are only active for gradient steps; every score is computed in
//! evaluation mode. Weight initialisation and dropout masks draw from a
//! ChaCha8 stream seeded from the config, so a fit is reproducible.

use candle_core::{DType, Module, ModuleT, Tensor, Var};
use candle_nn::{
    batch_norm, linear, AdamW, BatchNorm, BatchNormConfig, Linear, Optimizer, ParamsAdamW,
    VarBuilder, VarMap,
};
use embedding::{ExecutionContext, Label};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::calibrate::calibrate;
use crate::detector::{AnomalyModel, FitSummary, ThresholdSource, ValidationSet};
use crate::metrics::EvaluationReport;
use crate::stats::{check_matrix, mean_std};
use crate::{persist, AnomalyError, AutoencoderConfig, DetectorMethod};

const SCORE_BATCH: usize = 256;
const MIN_LR_DELTA: f64 = 1e-8;

struct Block {
    linear: Linear,
    norm: BatchNorm,
}

impl Block {
    fn new(fan_in: usize, fan_out: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            linear: linear(fan_in, fan_out, vb.pp("linear"))?,
            norm: batch_norm(fan_out, BatchNormConfig::default(), vb.pp("norm"))?,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.linear.forward(xs)?;
        self.norm.forward_t(&xs, train)?.relu()
    }
}

struct Network {
    encoder: Vec<Block>,
    latent: Linear,
    decoder: Vec<Block>,
    output: Linear,
    dropout: f32,
}

impl Network {
    fn build(input_dim: usize, cfg: &AutoencoderConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut prev = input_dim;
        let mut encoder = Vec::with_capacity(cfg.hidden_dims.len());
        for (i, &width) in cfg.hidden_dims.iter().enumerate() {
            encoder.push(Block::new(prev, width, vb.pp("encoder").pp(i))?);
            prev = width;
        }
        let latent = linear(prev, cfg.latent_dim, vb.pp("latent"))?;
        prev = cfg.latent_dim;
        let mut decoder = Vec::with_capacity(cfg.hidden_dims.len());
        for (i, &width) in cfg.hidden_dims.iter().rev().enumerate() {
            decoder.push(Block::new(prev, width, vb.pp("decoder").pp(i))?);
            prev = width;
        }
        let output = linear(prev, input_dim, vb.pp("output"))?;
        Ok(Self {
            encoder,
            latent,
            decoder,
            output,
            dropout: cfg.dropout,
        })
    }

    /// Training mode iff `rng` is given: batch statistics plus dropout.
    fn forward(&self, xs: &Tensor, mut rng: Option<&mut ChaCha8Rng>) -> candle_core::Result<Tensor> {
        let train = rng.is_some();
        let mut h = xs.clone();
        for block in &self.encoder {
            h = block.forward(&h, train)?;
            if let Some(rng) = rng.as_deref_mut() {
                h = dropout(&h, self.dropout, rng)?;
            }
        }
        h = self.latent.forward(&h)?;
        for block in &self.decoder {
            h = block.forward(&h, train)?;
            if let Some(rng) = rng.as_deref_mut() {
                h = dropout(&h, self.dropout, rng)?;
            }
        }
        self.output.forward(&h)
    }
}

/// Inverted dropout with a mask drawn from `rng`.
fn dropout(xs: &Tensor, p: f32, rng: &mut ChaCha8Rng) -> candle_core::Result<Tensor> {
    if p <= 0.0 {
        return Ok(xs.clone());
    }
    let scale = 1.0 / (1.0 - p);
    let mask: Vec<f32> = (0..xs.elem_count())
        .map(|_| if rng.gen::<f32>() < p { 0.0 } else { scale })
        .collect();
    let mask = Tensor::from_vec(mask, xs.dims(), xs.device())?;
    xs.mul(&mask)
}

/// `(name, fan_in, fan_out)` of every linear layer, in the order `Network::build` creates them.
fn linear_layers(input_dim: usize, cfg: &AutoencoderConfig) -> Vec<(String, usize, usize)> {
    let mut layers = Vec::new();
    let mut prev = input_dim;
    for (i, &width) in cfg.hidden_dims.iter().enumerate() {
        layers.push((format!("encoder.{i}.linear"), prev, width));
        prev = width;
    }
    layers.push(("latent".to_string(), prev, cfg.latent_dim));
    prev = cfg.latent_dim;
    for (i, &width) in cfg.hidden_dims.iter().rev().enumerate() {
        layers.push((format!("decoder.{i}.linear"), prev, width));
        prev = width;
    }
    layers.push(("output".to_string(), prev, input_dim));
    layers
}

fn lock_err<T>(_: T) -> AnomalyError {
    AnomalyError::Persistence("parameter store lock poisoned".into())
}

/// Pre-populate linear weights with `U(-1/√fan_in, 1/√fan_in)`.
fn seed_linears(
    varmap: &VarMap,
    input_dim: usize,
    cfg: &AutoencoderConfig,
    rng: &mut ChaCha8Rng,
    ctx: &ExecutionContext,
) -> Result<(), AnomalyError> {
    let mut data = varmap.data().lock().map_err(lock_err)?;
    for (name, fan_in, fan_out) in linear_layers(input_dim, cfg) {
        let bound = 1.0 / (fan_in as f32).sqrt();
        let weight: Vec<f32> = (0..fan_in * fan_out)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let bias: Vec<f32> = (0..fan_out).map(|_| rng.gen_range(-bound..bound)).collect();
        let weight = Tensor::from_vec(weight, (fan_out, fan_in), ctx.device())?;
        let bias = Tensor::from_vec(bias, fan_out, ctx.device())?;
        data.insert(format!("{name}.weight"), Var::from_tensor(&weight)?);
        data.insert(format!("{name}.bias"), Var::from_tensor(&bias)?);
    }
    Ok(())
}

/// ReduceLROnPlateau in `min` mode with a relative improvement threshold.
#[derive(Debug, Clone)]
pub(crate) struct PlateauScheduler {
    factor: f64,
    patience: usize,
    threshold: f64,
    best: f64,
    bad_epochs: usize,
}

impl PlateauScheduler {
    pub(crate) fn new(cfg: &AutoencoderConfig) -> Self {
        Self {
            factor: cfg.lr_factor,
            patience: cfg.lr_patience,
            threshold: cfg.lr_threshold,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    /// Returns the reduced learning rate when the loss has plateaued.
    pub(crate) fn step(&mut self, loss: f32, current_lr: f64) -> Option<f64> {
        let loss = f64::from(loss);
        if loss < self.best * (1.0 - self.threshold) {
            self.best = loss;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }
        if self.bad_epochs > self.patience {
            self.bad_epochs = 0;
            let reduced = current_lr * self.factor;
            if current_lr - reduced > MIN_LR_DELTA {
                return Some(reduced);
            }
        }
        None
    }
}

struct Trained {
    network: Network,
    varmap: VarMap,
    input_dim: usize,
    threshold: f32,
    epochs: usize,
    final_loss: f32,
}

#[derive(Serialize, Deserialize)]
struct StoredTensor {
    name: String,
    shape: Vec<usize>,
    values: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct StoredAutoencoder {
    config: AutoencoderConfig,
    input_dim: usize,
    threshold: f32,
    epochs: usize,
    final_loss: f32,
    extractor_version: Option<String>,
    tensors: Vec<StoredTensor>,
}

/// Autoencoder reconstruction-error detector.
pub struct AutoencoderDetector {
    config: AutoencoderConfig,
    context: ExecutionContext,
    state: Option<Trained>,
    extractor_version: Option<String>,
}

impl fmt::Debug for AutoencoderDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoencoderDetector")
            .field("config", &self.config)
            .field("device", &self.context.describe())
            .field("threshold", &self.threshold())
            .field("epochs", &self.state.as_ref().map(|s| s.epochs))
            .finish()
    }
}

impl AutoencoderDetector {
    pub fn new(config: AutoencoderConfig, context: ExecutionContext) -> Result<Self, AnomalyError> {
        config.validate()?;
        Ok(Self {
            config,
            context,
            state: None,
            extractor_version: None,
        })
    }

    pub fn config(&self) -> &AutoencoderConfig {
        &self.config
    }

    /// Epochs run by the last successful fit.
    pub fn epochs_trained(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.epochs)
    }

    /// Encode-decode reproduction of each embedding, in evaluation mode.
    pub fn reconstruct(&self, x: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, AnomalyError> {
        let trained = self.fitted()?;
        check_matrix(x, Some(trained.input_dim))?;
        let mut out = Vec::with_capacity(x.len());
        for chunk in x.chunks(SCORE_BATCH) {
            let input = self.to_tensor(chunk, trained.input_dim)?;
            out.extend(trained.network.forward(&input, None)?.to_vec2::<f32>()?);
        }
        Ok(out)
    }

    pub(crate) fn from_blob(bytes: &[u8], context: ExecutionContext) -> Result<Self, AnomalyError> {
        let stored: StoredAutoencoder = persist::decode(DetectorMethod::Autoencoder, bytes)?;
        stored.config.validate()?;

        let varmap = VarMap::new();
        {
            let mut data = varmap.data().lock().map_err(lock_err)?;
            for t in &stored.tensors {
                let tensor = Tensor::from_vec(t.values.clone(), t.shape.as_slice(), context.device())
                    .map_err(|e| AnomalyError::Persistence(format!("tensor {}: {e}", t.name)))?;
                data.insert(t.name.clone(), Var::from_tensor(&tensor)?);
            }
        }
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, context.device());
        let network = Network::build(stored.input_dim, &stored.config, vb)
            .map_err(|e| AnomalyError::Persistence(format!("stored weights do not fit the architecture: {e}")))?;
        if varmap.all_vars().len() != stored.tensors.len() {
            return Err(AnomalyError::Persistence(
                "stored weights are missing parameters".into(),
            ));
        }

        Ok(Self {
            config: stored.config,
            context,
            state: Some(Trained {
                network,
                varmap,
                input_dim: stored.input_dim,
                threshold: stored.threshold,
                epochs: stored.epochs,
                final_loss: stored.final_loss,
            }),
            extractor_version: stored.extractor_version,
        })
    }

    fn fitted(&self) -> Result<&Trained, AnomalyError> {
        self.state.as_ref().ok_or(AnomalyError::NotFitted)
    }

    fn to_tensor(&self, rows: &[Vec<f32>], dim: usize) -> Result<Tensor, AnomalyError> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (rows.len(), dim), self.context.device())?)
    }

    fn errors(&self, network: &Network, x: &[Vec<f32>], dim: usize) -> Result<Vec<f32>, AnomalyError> {
        let mut out = Vec::with_capacity(x.len());
        for chunk in x.chunks(SCORE_BATCH) {
            let input = self.to_tensor(chunk, dim)?;
            let recon = network.forward(&input, None)?;
            let err = recon.sub(&input)?.sqr()?.mean(1)?;
            out.extend(err.to_vec1::<f32>()?);
        }
        Ok(out)
    }

    /// Mini-batch training; returns the network with its epoch count and last loss.
    fn train(&self, x: &[Vec<f32>], dim: usize) -> Result<(Network, VarMap, usize, f32), AnomalyError> {
        let cfg = &self.config;
        let device = self.context.device();
        let n = x.len();
        let bs = cfg.batch_size;

        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let varmap = VarMap::new();
        seed_linears(&varmap, dim, cfg, &mut rng, &self.context)?;
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let network = Network::build(dim, cfg, vb)?;
        let data = self.to_tensor(x, dim)?;

        let params = ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: cfg.weight_decay,
            ..Default::default()
        };
        let mut opt = AdamW::new(varmap.all_vars(), params)?;
        let mut scheduler = PlateauScheduler::new(cfg);
        let mut order: Vec<usize> = (0..n).collect();
        let batches = n / bs;
        let mut best = f32::INFINITY;
        let mut stale = 0usize;
        let mut epochs = 0usize;
        let mut last_loss = f32::NAN;

        for epoch in 1..=cfg.max_epochs {
            order.shuffle(&mut rng);
            let mut total = 0.0f64;
            for b in 0..batches {
                let ids: Vec<u32> = order[b * bs..(b + 1) * bs].iter().map(|&i| i as u32).collect();
                let ids = Tensor::from_vec(ids, bs, device)?;
                let batch = data.index_select(&ids, 0)?;
                let recon = network.forward(&batch, Some(&mut rng))?;
                let loss = candle_nn::loss::mse(&recon, &batch)?;
                let value = loss.to_scalar::<f32>()?;
                if !value.is_finite() {
                    return Err(AnomalyError::Numeric { epoch, loss: value });
                }
                opt.backward_step(&loss)?;
                total += f64::from(value);
            }

            let avg = (total / batches as f64) as f32;
            epochs = epoch;
            last_loss = avg;

            if let Some(lr) = scheduler.step(avg, opt.learning_rate()) {
                opt.set_learning_rate(lr);
                debug!(epoch, lr, "learning rate reduced");
            }
            if avg < best {
                best = avg;
                stale = 0;
            } else {
                stale += 1;
            }
            if cfg.log_every > 0 && epoch % cfg.log_every == 0 {
                info!(epoch, loss = avg, "autoencoder training");
            }
            if stale >= cfg.early_stopping_patience {
                info!(epoch, best_loss = best, "early stopping");
                break;
            }
        }

        Ok((network, varmap, epochs, last_loss))
    }
}

impl AnomalyModel for AutoencoderDetector {
    fn method(&self) -> DetectorMethod {
        DetectorMethod::Autoencoder
    }

    fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    fn threshold(&self) -> Option<f32> {
        self.state.as_ref().map(|s| s.threshold)
    }

    fn scores(&self, x: &[Vec<f32>]) -> Result<Vec<f32>, AnomalyError> {
        let trained = self.fitted()?;
        check_matrix(x, Some(trained.input_dim))?;
        self.errors(&trained.network, x, trained.input_dim)
    }

    fn fit(
        &mut self,
        x: &[Vec<f32>],
        validation: Option<ValidationSet<'_>>,
    ) -> Result<FitSummary, AnomalyError> {
        self.config.validate()?;
        let dim = check_matrix(x, None)?;
        if x.len() < self.config.batch_size {
            return Err(AnomalyError::Config(format!(
                "autoencoder needs at least one mini-batch of {} embeddings, got {}",
                self.config.batch_size,
                x.len()
            )));
        }
        if let Some(v) = &validation {
            check_matrix(v.embeddings, Some(dim))?;
        }

        let (network, varmap, epochs, final_loss) = self.train(x, dim)?;

        if validation.as_ref().is_some_and(|v| !v.has_both_classes()) {
            warn!("validation labels hold a single class; using the sigma threshold");
        }
        let (threshold, source) = match &validation {
            Some(v) if v.has_both_classes() => (
                calibrate(&self.errors(&network, v.embeddings, dim)?, v.labels)?,
                ThresholdSource::Validation,
            ),
            _ => {
                let (mean, std) = mean_std(&self.errors(&network, x, dim)?);
                (mean + self.config.sigma_multiplier * std, ThresholdSource::Sigma)
            }
        };
        if !threshold.is_finite() {
            return Err(AnomalyError::Numeric {
                epoch: epochs,
                loss: threshold,
            });
        }

        info!(
            samples = x.len(),
            epochs,
            final_loss,
            threshold,
            source = source.as_str(),
            "autoencoder detector fitted"
        );

        self.state = Some(Trained {
            network,
            varmap,
            input_dim: dim,
            threshold,
            epochs,
            final_loss,
        });
        Ok(FitSummary {
            method: DetectorMethod::Autoencoder,
            samples: x.len(),
            threshold,
            threshold_source: source,
            iterations: epochs,
            final_loss: Some(final_loss),
        })
    }

    fn evaluate(&self, x: &[Vec<f32>], labels: Option<&[Label]>) -> Result<EvaluationReport, AnomalyError> {
        let trained = self.fitted()?;
        let scores = self.scores(x)?;
        EvaluationReport::build(DetectorMethod::Autoencoder, trained.threshold, &scores, labels, None)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, AnomalyError> {
        let trained = self.fitted()?;
        let mut tensors = Vec::new();
        {
            let data = trained.varmap.data().lock().map_err(lock_err)?;
            for (name, var) in data.iter() {
                let tensor = var.as_tensor();
                tensors.push(StoredTensor {
                    name: name.clone(),
                    shape: tensor.dims().to_vec(),
                    values: tensor.flatten_all()?.to_vec1::<f32>()?,
                });
            }
        }
        tensors.sort_by(|a, b| a.name.cmp(&b.name));

        let stored = StoredAutoencoder {
            config: self.config.clone(),
            input_dim: trained.input_dim,
            threshold: trained.threshold,
            epochs: trained.epochs,
            final_loss: trained.final_loss,
            extractor_version: self.extractor_version.clone(),
            tensors,
        };
        persist::encode(
            DetectorMethod::Autoencoder,
            self.extractor_version.as_deref(),
            &stored,
        )
    }

    fn extractor_version(&self) -> Option<&str> {
        self.extractor_version.as_deref()
    }

    fn set_extractor_version(&mut self, version: Option<String>) {
        self.extractor_version = version;
    }
}
