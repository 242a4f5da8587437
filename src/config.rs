//! YAML Configuration File Support for MedGuard
//!
//! One YAML file describes a whole training run: where the labeled images
//! live, how embeddings are extracted, which anomaly models are fitted and
//! where the fitted models and reports are written.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//! name: "blister packs"
//!
//! data:
//!   genuine_dir: "real_medicines"
//!   counterfeit_dir: "fake_medicines"
//!   val_fraction: 0.2
//!   seed: 42
//!
//! extractor:
//!   backbone: "resnet18"
//!   weights_path: "weights/resnet18.safetensors"
//!   image_size: 224
//!   normalize: false
//!   device: "cpu"
//!
//! fine_tune:
//!   epochs: 20
//!   margin: 1.0
//!
//! detectors: ["kmeans", "autoencoder"]
//!
//! kmeans:
//!   n_clusters: 3
//!
//! autoencoder:
//!   hidden_dims: [256, 128]
//!   latent_dim: 64
//!   max_epochs: 100
//!
//! ensemble:
//!   high_confidence_threshold: 0.7
//!
//! output:
//!   model_dir: "models"
//!   report_dir: "reports"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anomaly::{AutoencoderConfig, ClusterConfig, DetectorConfig, DetectorMethod, EnsembleConfig};
use embedding::{ExtractorConfig, FineTuneConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading YAML configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Top-level YAML configuration for a MedGuard training run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct MedguardConfig {
    /// Configuration format version
    pub version: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub data: DataYamlConfig,

    #[serde(default)]
    pub extractor: ExtractorConfig,

    /// Fine-tune the embedding head before fitting when present
    #[serde(default)]
    pub fine_tune: Option<FineTuneConfig>,

    /// Models to fit, in order
    #[serde(default = "default_detectors")]
    pub detectors: Vec<DetectorMethod>,

    #[serde(default)]
    pub kmeans: ClusterConfig,

    #[serde(default)]
    pub autoencoder: AutoencoderConfig,

    #[serde(default)]
    pub ensemble: EnsembleConfig,

    #[serde(default)]
    pub output: OutputYamlConfig,
}

impl Default for MedguardConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            name: None,
            data: DataYamlConfig::default(),
            extractor: ExtractorConfig::default(),
            fine_tune: None,
            detectors: default_detectors(),
            kmeans: ClusterConfig::default(),
            autoencoder: AutoencoderConfig::default(),
            ensemble: EnsembleConfig::default(),
            output: OutputYamlConfig::default(),
        }
    }
}

impl MedguardConfig {
    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: MedguardConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigLoadError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        self.data.validate()?;
        self.extractor
            .validate()
            .map_err(|e| ConfigLoadError::Validation(format!("extractor: {e}")))?;
        if let Some(fine_tune) = &self.fine_tune {
            fine_tune
                .validate()
                .map_err(|e| ConfigLoadError::Validation(format!("fine_tune: {e}")))?;
        }

        if self.detectors.is_empty() {
            return Err(ConfigLoadError::Validation(
                "detectors must name at least one model".to_string(),
            ));
        }
        for (i, method) in self.detectors.iter().enumerate() {
            if self.detectors[..i].contains(method) {
                return Err(ConfigLoadError::Validation(format!(
                    "detector '{method}' listed twice"
                )));
            }
            self.detector_config(*method)
                .validate()
                .map_err(|e| ConfigLoadError::Validation(format!("{method}: {e}")))?;
        }

        self.ensemble
            .validate()
            .map_err(|e| ConfigLoadError::Validation(format!("ensemble: {e}")))?;
        Ok(())
    }

    /// Detector configuration for one of the listed models.
    pub fn detector_config(&self, method: DetectorMethod) -> DetectorConfig {
        DetectorConfig {
            method,
            cluster: self.kmeans.clone(),
            autoencoder: self.autoencoder.clone(),
        }
    }
}

/// Labeled training data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataYamlConfig {
    #[serde(default = "default_genuine_dir")]
    pub genuine_dir: PathBuf,

    #[serde(default = "default_counterfeit_dir")]
    pub counterfeit_dir: PathBuf,

    /// Share of each class held out for calibration and evaluation
    #[serde(default = "default_val_fraction")]
    pub val_fraction: f64,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Fit on the genuine part of the training split only
    #[serde(default)]
    pub train_on_genuine_only: bool,
}

impl DataYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if !(self.val_fraction > 0.0 && self.val_fraction < 1.0) {
            return Err(ConfigLoadError::Validation(format!(
                "data.val_fraction must lie in (0, 1), got {}",
                self.val_fraction
            )));
        }
        if self.genuine_dir == self.counterfeit_dir {
            return Err(ConfigLoadError::Validation(
                "data.genuine_dir and data.counterfeit_dir must differ".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DataYamlConfig {
    fn default() -> Self {
        Self {
            genuine_dir: default_genuine_dir(),
            counterfeit_dir: default_counterfeit_dir(),
            val_fraction: default_val_fraction(),
            seed: default_seed(),
            train_on_genuine_only: false,
        }
    }
}

/// Where a run writes its artifacts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputYamlConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    #[serde(default = "default_labels_csv")]
    pub labels_csv: PathBuf,
}

impl Default for OutputYamlConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            report_dir: default_report_dir(),
            labels_csv: default_labels_csv(),
        }
    }
}

// Helper functions for serde defaults
fn default_detectors() -> Vec<DetectorMethod> {
    DetectorMethod::ALL.to_vec()
}
fn default_genuine_dir() -> PathBuf {
    PathBuf::from("real_medicines")
}
fn default_counterfeit_dir() -> PathBuf {
    PathBuf::from("fake_medicines")
}
fn default_val_fraction() -> f64 {
    0.2
}
fn default_seed() -> u64 {
    42
}
fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}
fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}
fn default_labels_csv() -> PathBuf {
    PathBuf::from("labels.csv")
}
