use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use anomaly::{
    combine, AnomalyDetector, AnomalyModel, DetectorMethod, EnsembleConfig, EnsembleVerdict,
};
use chrono::{DateTime, Utc};
use embedding::{ExecutionContext, ImageExtractor, HEAD_FILE};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Everything needed to answer a prediction, loaded once and never mutated.
///
/// A reload builds a fresh registry and swaps it in whole.
pub struct ModelRegistry {
    extractor: Option<ImageExtractor>,
    detectors: BTreeMap<DetectorMethod, AnomalyDetector>,
    loaded_at: DateTime<Utc>,
}

/// Which models a registry holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedModels {
    pub kmeans: bool,
    pub autoencoder: bool,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self::from_parts(None, Vec::new())
    }

    pub fn from_parts(extractor: Option<ImageExtractor>, detectors: Vec<AnomalyDetector>) -> Self {
        Self {
            extractor,
            detectors: detectors.into_iter().map(|d| (d.method(), d)).collect(),
            loaded_at: Utc::now(),
        }
    }

    /// Load the extractor and whatever model blobs exist in `model_dir`.
    ///
    /// Missing or unreadable pieces are logged and left out so the service
    /// can start and report what it lacks. Only an unusable device string
    /// is an error.
    pub fn load(config: &ServerConfig) -> ServerResult<Self> {
        let context = ExecutionContext::from_spec(&config.extractor.device)
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let mut extractor_cfg = config.extractor.clone();
        let head = config.model_dir.join(HEAD_FILE);
        if extractor_cfg.head_path.is_none() && head.is_file() {
            extractor_cfg.head_path = Some(head);
        }
        let extractor = match ImageExtractor::with_context(extractor_cfg, context.clone()) {
            Ok(extractor) => Some(extractor),
            Err(err) => {
                warn!(error = %err, "embedding extractor unavailable");
                None
            }
        };

        let mut detectors = Vec::new();
        for method in DetectorMethod::ALL {
            let path = config.model_dir.join(method.file_name());
            if !path.is_file() {
                warn!(%method, path = %path.display(), "model file not found");
                continue;
            }
            match AnomalyDetector::load(&path, &context) {
                Ok(detector) => {
                    info!(%method, path = %path.display(), "model loaded");
                    detectors.push(detector);
                }
                Err(err) => warn!(%method, error = %err, "model could not be loaded"),
            }
        }

        if let Some(extractor) = &extractor {
            let version = extractor.version();
            for detector in &detectors {
                if detector.extractor_version() != Some(version.as_str()) {
                    warn!(
                        method = %detector.method(),
                        fitted = detector.extractor_version().unwrap_or("unknown"),
                        serving = %version,
                        "model was fitted against a different extractor"
                    );
                }
            }
        }

        Ok(Self::from_parts(extractor, detectors))
    }

    pub fn is_loaded(&self, method: DetectorMethod) -> bool {
        self.detectors.contains_key(&method)
    }

    pub fn loaded_models(&self) -> LoadedModels {
        LoadedModels {
            kmeans: self.is_loaded(DetectorMethod::Kmeans),
            autoencoder: self.is_loaded(DetectorMethod::Autoencoder),
        }
    }

    pub fn extractor_loaded(&self) -> bool {
        self.extractor.is_some()
    }

    pub fn extractor_version(&self) -> Option<String> {
        self.extractor.as_ref().map(ImageExtractor::version)
    }

    /// Ready when an image can be embedded and at least one model scores it.
    pub fn is_ready(&self) -> bool {
        self.extractor.is_some() && !self.detectors.is_empty()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Embed one encoded image and combine every loaded model's verdict.
    pub fn predict(&self, image: &[u8], ensemble: &EnsembleConfig) -> ServerResult<EnsembleVerdict> {
        let extractor = self
            .extractor
            .as_ref()
            .ok_or_else(|| ServerError::ModelNotLoaded("embedding extractor".to_string()))?;
        if self.detectors.is_empty() {
            return Err(ServerError::ModelNotLoaded(
                "no anomaly models are loaded".to_string(),
            ));
        }

        let embedding = vec![extractor.extract_image_bytes(image)?];
        let mut verdicts = BTreeMap::new();
        for (method, detector) in &self.detectors {
            let verdict = detector
                .verdicts(&embedding)?
                .first()
                .copied()
                .ok_or_else(|| ServerError::Internal(format!("{method} returned no score")))?;
            verdicts.insert(method.to_string(), verdict);
        }
        Ok(combine(&verdicts, ensemble)?)
    }
}

/// Shared application state
pub struct ServerState {
    /// Server configuration
    pub config: Arc<ServerConfig>,

    registry: RwLock<Arc<ModelRegistry>>,
}

impl ServerState {
    /// Create new server state, loading models from `config.model_dir`
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let registry = ModelRegistry::load(&config)?;
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: ServerConfig, registry: ModelRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: RwLock::new(Arc::new(registry)),
        }
    }

    /// Snapshot of the current registry; unaffected by later reloads.
    pub fn registry(&self) -> Arc<ModelRegistry> {
        let guard = self.registry.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Install a new registry, returning the previous one.
    pub fn replace_registry(&self, registry: ModelRegistry) -> Arc<ModelRegistry> {
        let mut guard = self.registry.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_not_ready() {
        let registry = ModelRegistry::empty();
        assert!(!registry.is_ready());
        assert_eq!(
            registry.loaded_models(),
            LoadedModels {
                kmeans: false,
                autoencoder: false
            }
        );
        let err = registry.predict(b"png", &EnsembleConfig::default()).unwrap_err();
        assert!(matches!(err, ServerError::ModelNotLoaded(_)));
    }

    #[test]
    fn load_from_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            model_dir: dir.path().to_path_buf(),
            extractor: embedding::ExtractorConfig::default()
                .with_weights(None)
                .with_image_size(32),
            ..Default::default()
        };
        let registry = ModelRegistry::load(&config).unwrap();
        assert!(registry.extractor_loaded());
        assert!(!registry.is_ready());
        assert!(registry.extractor_version().unwrap().starts_with("resnet18+random"));
    }

    #[test]
    fn bad_device_is_a_config_error() {
        let config = ServerConfig {
            extractor: embedding::ExtractorConfig {
                device: "tpu".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            ModelRegistry::load(&config),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn replace_swaps_snapshots() {
        let state = ServerState::with_registry(ServerConfig::default(), ModelRegistry::empty());
        let before = state.registry();
        let old = state.replace_registry(ModelRegistry::empty());
        assert!(Arc::ptr_eq(&before, &old));
        assert!(!Arc::ptr_eq(&before, &state.registry()));
    }
}
