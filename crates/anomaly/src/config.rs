use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::AnomalyError;

/// Which anomaly model a detector wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorMethod {
    Kmeans,
    Autoencoder,
}

impl DetectorMethod {
    pub const ALL: [DetectorMethod; 2] = [DetectorMethod::Kmeans, DetectorMethod::Autoencoder];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorMethod::Kmeans => "kmeans",
            DetectorMethod::Autoencoder => "autoencoder",
        }
    }

    /// Default file name of the persisted model.
    pub fn file_name(&self) -> &'static str {
        match self {
            DetectorMethod::Kmeans => "kmeans_detector.bin",
            DetectorMethod::Autoencoder => "autoencoder_detector.bin",
        }
    }
}

impl fmt::Display for DetectorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorMethod {
    type Err = AnomalyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kmeans" => Ok(DetectorMethod::Kmeans),
            "autoencoder" => Ok(DetectorMethod::Autoencoder),
            other => Err(AnomalyError::Config(format!(
                "unknown detector method '{other}' (expected 'kmeans' or 'autoencoder')"
            ))),
        }
    }
}

fn check_sigma(sigma: f32) -> Result<(), AnomalyError> {
    if !sigma.is_finite() || sigma < 0.0 {
        return Err(AnomalyError::Config(format!(
            "sigma_multiplier must be finite and non-negative, got {sigma}"
        )));
    }
    Ok(())
}

/// K-means hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub n_clusters: usize,
    pub max_iter: usize,
    /// Convergence bound on the summed squared centroid shift.
    pub tolerance: f32,
    /// Independent k-means++ restarts; the lowest inertia wins.
    pub n_init: usize,
    pub seed: u64,
    /// Fallback threshold is `mean + sigma_multiplier * std` of training distances.
    pub sigma_multiplier: f32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            n_clusters: 3,
            max_iter: 300,
            tolerance: 1e-4,
            n_init: 1,
            seed: 42,
            sigma_multiplier: 2.0,
        }
    }
}

impl ClusterConfig {
    pub fn with_clusters(mut self, k: usize) -> Self {
        self.n_clusters = k;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), AnomalyError> {
        if self.n_clusters == 0 {
            return Err(AnomalyError::Config("n_clusters must be positive".into()));
        }
        if self.max_iter == 0 || self.n_init == 0 {
            return Err(AnomalyError::Config(
                "max_iter and n_init must be positive".into(),
            ));
        }
        if !(self.tolerance >= 0.0) {
            return Err(AnomalyError::Config("tolerance must be non-negative".into()));
        }
        check_sigma(self.sigma_multiplier)
    }
}

/// Autoencoder architecture and training schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoencoderConfig {
    /// Widths of the hidden blocks on the encoder side; the decoder mirrors them.
    pub hidden_dims: Vec<usize>,
    pub latent_dim: usize,
    pub dropout: f32,
    pub learning_rate: f64,
    /// Decoupled (AdamW) decay, applied to the weights directly rather than
    /// added to the gradient as an L2 term, so it does not interact with the
    /// adaptive moments.
    pub weight_decay: f64,
    pub batch_size: usize,
    pub max_epochs: usize,
    /// Consecutive non-improving epochs before training stops.
    pub early_stopping_patience: usize,
    /// Consecutive non-improving epochs before the learning rate is cut.
    pub lr_patience: usize,
    pub lr_factor: f64,
    /// Relative improvement the scheduler requires.
    pub lr_threshold: f64,
    pub seed: u64,
    pub sigma_multiplier: f32,
    pub log_every: usize,
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![256, 128],
            latent_dim: 64,
            dropout: 0.2,
            learning_rate: 1e-3,
            weight_decay: 1e-5,
            batch_size: 32,
            max_epochs: 100,
            early_stopping_patience: 10,
            lr_patience: 5,
            lr_factor: 0.1,
            lr_threshold: 1e-4,
            seed: 42,
            sigma_multiplier: 2.0,
            log_every: 10,
        }
    }
}

impl AutoencoderConfig {
    pub fn with_max_epochs(mut self, epochs: usize) -> Self {
        self.max_epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_architecture(mut self, hidden_dims: Vec<usize>, latent_dim: usize) -> Self {
        self.hidden_dims = hidden_dims;
        self.latent_dim = latent_dim;
        self
    }

    pub fn validate(&self) -> Result<(), AnomalyError> {
        if self.latent_dim == 0 || self.hidden_dims.iter().any(|d| *d == 0) {
            return Err(AnomalyError::Config("layer widths must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(AnomalyError::Config(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(self.learning_rate > 0.0) || self.weight_decay < 0.0 {
            return Err(AnomalyError::Config(
                "learning_rate must be positive and weight_decay non-negative".into(),
            ));
        }
        if self.batch_size == 0 || self.max_epochs == 0 {
            return Err(AnomalyError::Config(
                "batch_size and max_epochs must be positive".into(),
            ));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(AnomalyError::Config("lr_factor must lie in (0, 1)".into()));
        }
        check_sigma(self.sigma_multiplier)
    }
}

/// Everything needed to build a detector of either kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub method: DetectorMethod,
    pub cluster: ClusterConfig,
    pub autoencoder: AutoencoderConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            method: DetectorMethod::Kmeans,
            cluster: ClusterConfig::default(),
            autoencoder: AutoencoderConfig::default(),
        }
    }
}

impl DetectorConfig {
    pub fn for_method(method: DetectorMethod) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), AnomalyError> {
        match self.method {
            DetectorMethod::Kmeans => self.cluster.validate(),
            DetectorMethod::Autoencoder => self.autoencoder.validate(),
        }
    }
}

/// Ensemble banding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Aggregates strictly inside `(1 - τ, τ)` carry a low-confidence warning.
    pub high_confidence_threshold: f32,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            high_confidence_threshold: 0.7,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<(), AnomalyError> {
        let tau = self.high_confidence_threshold;
        if !(tau > 0.5 && tau <= 1.0) {
            return Err(AnomalyError::Config(format!(
                "high_confidence_threshold must lie in (0.5, 1], got {tau}"
            )));
        }
        Ok(())
    }
}
