//! MedGuard image embeddings
//!
//! Turns medicine package photos into fixed-length feature vectors. A
//! ResNet trunk (classifier removed) does the heavy lifting; an optional
//! `D×D` head, fine-tuned with a triplet loss, can sit on top of it.
//!
//! The pipeline per image is deterministic: decode, resize, optional center
//! crop, ImageNet standardization, forward, optional L2 normalization.
//! Unreadable files are logged and skipped so one bad download never sinks a
//! whole directory.
//!
//! ## Quick example
//!
//! ```no_run
//! use embedding::{ExtractorConfig, ImageExtractor};
//!
//! let extractor = ImageExtractor::new(ExtractorConfig::default()).unwrap();
//! let batch = extractor.extract_dir("real_medicines").unwrap();
//! for (name, vector) in batch.filenames().iter().zip(batch.embeddings()) {
//!     println!("{name}: {} dims", vector.len());
//! }
//! ```
//!
//! ## Threading notes
//!
//! Extraction takes `&self` and decodes each batch on the rayon pool.
//! Fine-tuning takes `&mut self`, so it never overlaps with inference on the
//! same extractor.

pub mod config;
pub mod error;
pub mod types;

mod backbone;
mod finetune;
mod normalize;
mod preprocess;

pub use crate::backbone::ExecutionContext;
pub use crate::config::{BackboneKind, ExtractorConfig, FineTuneConfig, IMAGENET_MEAN, IMAGENET_STD};
pub use crate::error::EmbeddingError;
pub use crate::finetune::FineTuneReport;
pub use crate::preprocess::list_images;
pub use crate::types::{EmbeddingBatch, Label};

use candle_core::Tensor;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backbone::{Backbone, EmbeddingHead};
use crate::normalize::l2_normalize_in_place;
use crate::preprocess::{decode_bytes, decode_path, to_chw};

/// Conventional file name of a saved embedding head.
pub const HEAD_FILE: &str = "embedding_head.safetensors";

/// Convolutional feature extractor.
pub struct ImageExtractor {
    config: ExtractorConfig,
    context: ExecutionContext,
    backbone: Backbone,
}

impl std::fmt::Debug for ImageExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageExtractor")
            .field("version", &self.version())
            .field("device", &self.context.describe())
            .finish()
    }
}

impl ImageExtractor {
    /// Build an extractor on the device named in `config.device`.
    pub fn new(config: ExtractorConfig) -> Result<Self, EmbeddingError> {
        let context = ExecutionContext::from_spec(&config.device)?;
        Self::with_context(config, context)
    }

    pub fn with_context(
        config: ExtractorConfig,
        context: ExecutionContext,
    ) -> Result<Self, EmbeddingError> {
        config.validate()?;
        let backbone = Backbone::load(&config, &context)?;
        Ok(Self {
            config,
            context,
            backbone,
        })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn embedding_dim(&self) -> usize {
        self.backbone.kind().embedding_dim()
    }

    pub fn has_head(&self) -> bool {
        self.backbone.head.is_some()
    }

    /// Identifies everything that changes the embedding space.
    ///
    /// Models fitted against one version must not score embeddings from another.
    pub fn version(&self) -> String {
        let trunk = if self.backbone.is_pretrained() {
            self.backbone.kind().as_str().to_string()
        } else {
            format!(
                "{}+random{}",
                self.backbone.kind().as_str(),
                self.config.init_seed
            )
        };
        let crop = self
            .config
            .center_crop
            .map_or_else(|| "full".to_string(), |c| format!("crop{c}"));
        let l2 = if self.config.normalize { "l2" } else { "raw" };
        let head = if self.has_head() { "head" } else { "trunk" };
        format!("{trunk}/{}/{crop}/{l2}/{head}", self.config.image_size)
    }

    /// Embed every JPEG/PNG directly inside `dir`, in file-name order.
    pub fn extract_dir(&self, dir: impl AsRef<Path>) -> Result<EmbeddingBatch, EmbeddingError> {
        let dir = dir.as_ref();
        let paths = list_images(dir)?;
        if paths.is_empty() {
            return Err(EmbeddingError::NoImages(dir.to_path_buf()));
        }
        info!(dir = %dir.display(), images = paths.len(), "extracting embeddings");
        self.extract_paths(&paths)
    }

    /// Embed the given files. Unreadable ones are skipped with a warning.
    pub fn extract_paths(&self, paths: &[PathBuf]) -> Result<EmbeddingBatch, EmbeddingError> {
        let (embeddings, filenames) = self.run_paths(paths, true)?;
        EmbeddingBatch::new(embeddings, filenames, self.version())
    }

    /// Embed a single encoded image held in memory.
    pub fn extract_image_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let img = decode_bytes(bytes)?;
        let pixels = to_chw(&img, &self.config);
        self.forward(vec![pixels], true)?
            .pop()
            .ok_or_else(|| EmbeddingError::Training("forward pass returned no rows".into()))
    }

    /// Fine-tune the embedding head on the given images with a triplet loss.
    ///
    /// Starts from the current head (identity when none is loaded). On
    /// failure the previous head is kept.
    pub fn fine_tune(
        &mut self,
        paths: &[PathBuf],
        cfg: &FineTuneConfig,
    ) -> Result<FineTuneReport, EmbeddingError> {
        cfg.validate()?;
        let features = match self.run_paths(paths, false) {
            Ok((features, _)) => features,
            Err(EmbeddingError::NoImagesDecoded { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        if features.len() < 2 {
            return Err(EmbeddingError::InvalidConfig(format!(
                "fine-tuning needs at least two decodable images, got {}",
                features.len()
            )));
        }

        let device = self.context.device();
        let candidate = match &self.backbone.head {
            Some(head) => head.duplicate()?,
            None => EmbeddingHead::identity(self.embedding_dim(), device)?,
        };
        let report = finetune::train_head(&features, &candidate, cfg, device)?;
        self.backbone.head = Some(candidate);
        Ok(report)
    }

    /// Write the embedding head as safetensors.
    pub fn save_head(&self, path: impl AsRef<Path>) -> Result<(), EmbeddingError> {
        let head = self.backbone.head.as_ref().ok_or_else(|| {
            EmbeddingError::InvalidConfig("extractor has no embedding head to save".into())
        })?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        head.save(path)?;
        info!(path = %path.display(), "embedding head saved");
        Ok(())
    }

    fn run_paths(
        &self,
        paths: &[PathBuf],
        finished: bool,
    ) -> Result<(Vec<Vec<f32>>, Vec<String>), EmbeddingError> {
        let mut embeddings = Vec::with_capacity(paths.len());
        let mut filenames = Vec::with_capacity(paths.len());

        for chunk in paths.chunks(self.config.batch_size) {
            let decoded: Vec<_> = chunk
                .par_iter()
                .map(|path| decode_path(path).map(|img| to_chw(&img, &self.config)))
                .collect();

            let mut pixels = Vec::with_capacity(chunk.len());
            for (path, result) in chunk.iter().zip(decoded) {
                match result {
                    Ok(p) => {
                        pixels.push(p);
                        filenames.push(display_name(path));
                    }
                    Err(err) => warn!(path = %path.display(), error = %err, "skipping image"),
                }
            }
            if pixels.is_empty() {
                continue;
            }
            debug!(batch = pixels.len(), "forward pass");
            embeddings.extend(self.forward(pixels, finished)?);
        }

        if embeddings.is_empty() {
            return Err(EmbeddingError::NoImagesDecoded {
                attempted: paths.len(),
            });
        }
        if embeddings.len() < paths.len() {
            warn!(
                kept = embeddings.len(),
                attempted = paths.len(),
                "some images could not be processed"
            );
        }
        Ok((embeddings, filenames))
    }

    /// `finished` selects head + L2; otherwise raw trunk features are returned.
    fn forward(&self, pixels: Vec<Vec<f32>>, finished: bool) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let n = pixels.len();
        let side = self.config.input_size();
        let flat: Vec<f32> = pixels.into_iter().flatten().collect();
        let input = Tensor::from_vec(flat, (n, 3, side, side), self.context.device())?;

        let output = if finished {
            self.backbone.embed(&input)?
        } else {
            self.backbone.trunk_features(&input)?
        };
        let mut rows = output.to_vec2::<f32>()?;
        if finished && self.config.normalize {
            rows.iter_mut().for_each(|row| l2_normalize_in_place(row));
        }
        Ok(rows)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
