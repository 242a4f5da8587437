use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::EmbeddingError;

/// ImageNet channel statistics the pretrained trunks were trained with.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Convolutional trunk used to produce embeddings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    #[default]
    Resnet18,
    Resnet34,
}

impl BackboneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackboneKind::Resnet18 => "resnet18",
            BackboneKind::Resnet34 => "resnet34",
        }
    }

    /// Width of the pooled feature vector once the classifier is removed.
    pub fn embedding_dim(&self) -> usize {
        512
    }
}

/// Runtime configuration describing which trunk to load and how images are prepared.
///
/// # Example
/// ```no_run
/// use embedding::{ExtractorConfig, ImageExtractor};
///
/// let cfg = ExtractorConfig {
///     weights_path: Some("./models/resnet18.safetensors".into()),
///     normalize: true,
///     ..Default::default()
/// };
/// let extractor = ImageExtractor::new(cfg).unwrap();
/// let batch = extractor.extract_dir("real_medicines").unwrap();
/// println!("{} embeddings of dim {}", batch.len(), batch.dim());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Trunk architecture.
    pub backbone: BackboneKind,
    /// Safetensors file with pretrained trunk weights. When absent the trunk is
    /// randomly initialised, which is only useful for tests and smoke runs.
    pub weights_path: Option<PathBuf>,
    /// Safetensors file holding a fine-tuned embedding head.
    pub head_path: Option<PathBuf>,
    /// Square resolution images are resized to.
    pub image_size: usize,
    /// Optional center crop applied after resizing.
    pub center_crop: Option<usize>,
    /// Per-channel normalization mean.
    pub mean: [f32; 3],
    /// Per-channel normalization standard deviation.
    pub std: [f32; 3],
    /// Normalize each embedding to unit length.
    pub normalize: bool,
    /// Images per forward pass.
    pub batch_size: usize,
    /// Compute device: `"cpu"`, `"cuda"`, `"cuda:N"` or `"metal"`.
    pub device: String,
    /// Seed of the random trunk initialisation; unused with pretrained weights.
    pub init_seed: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneKind::Resnet18,
            weights_path: Some(PathBuf::from("./models/resnet18.safetensors")),
            head_path: None,
            image_size: 224,
            center_crop: None,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            normalize: false,
            batch_size: 32,
            device: "cpu".into(),
            init_seed: 42,
        }
    }
}

impl ExtractorConfig {
    /// Set the square input resolution.
    pub fn with_image_size(mut self, size: usize) -> Self {
        self.image_size = size;
        self
    }

    /// Set the trunk weights file; `None` selects a random initialisation.
    pub fn with_weights(mut self, path: Option<PathBuf>) -> Self {
        self.weights_path = path;
        self
    }

    pub fn with_center_crop(mut self, crop: Option<usize>) -> Self {
        self.center_crop = crop;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_init_seed(mut self, seed: u64) -> Self {
        self.init_seed = seed;
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    /// Side length of the tensor fed to the trunk.
    pub fn input_size(&self) -> usize {
        self.center_crop.unwrap_or(self.image_size)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), EmbeddingError> {
        // ResNet downsamples by 32; anything smaller collapses to nothing.
        if self.image_size < 32 {
            return Err(EmbeddingError::InvalidConfig(format!(
                "image_size must be at least 32, got {}",
                self.image_size
            )));
        }
        if let Some(crop) = self.center_crop {
            if crop < 32 || crop > self.image_size {
                return Err(EmbeddingError::InvalidConfig(format!(
                    "center_crop {crop} must lie in [32, {}]",
                    self.image_size
                )));
            }
        }
        if self.std.iter().any(|s| *s <= 0.0) {
            return Err(EmbeddingError::InvalidConfig(
                "normalization std must be positive".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Hyperparameters for triplet fine-tuning of the embedding head.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FineTuneConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Triplet margin.
    pub margin: f32,
    pub seed: u64,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 32,
            learning_rate: 1e-4,
            margin: 1.0,
            seed: 42,
        }
    }
}

impl FineTuneConfig {
    pub fn validate(&self) -> Result<(), EmbeddingError> {
        if self.epochs == 0 || self.batch_size < 2 {
            return Err(EmbeddingError::InvalidConfig(
                "fine-tuning needs at least one epoch and a batch of two".into(),
            ));
        }
        if !(self.learning_rate > 0.0) || !(self.margin >= 0.0) {
            return Err(EmbeddingError::InvalidConfig(
                "learning_rate must be positive and margin non-negative".into(),
            ));
        }
        Ok(())
    }
}
