use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Func, VarBuilder, VarMap};
use candle_transformers::models::resnet;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::config::{BackboneKind, ExtractorConfig};
use crate::EmbeddingError;

const HEAD_WEIGHT: &str = "head.weight";
const HEAD_BIAS: &str = "head.bias";

/// The compute device every tensor of a component lives on.
///
/// Built once from configuration and handed to constructors, so no method
/// ever has to decide between CPU and accelerator on its own.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    device: Device,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}

impl ExecutionContext {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
        }
    }

    /// Parse `"cpu"`, `"cuda"`, `"cuda:N"` or `"metal"`.
    pub fn from_spec(spec: &str) -> Result<Self, EmbeddingError> {
        let spec = spec.trim().to_ascii_lowercase();
        let device = match spec.as_str() {
            "" | "cpu" => Device::Cpu,
            "cuda" => Device::new_cuda(0)?,
            "metal" => Device::new_metal(0)?,
            other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
                Some(Ok(ordinal)) => Device::new_cuda(ordinal)?,
                _ => {
                    return Err(EmbeddingError::InvalidConfig(format!(
                        "unknown device '{other}'"
                    )))
                }
            },
        };
        Ok(Self { device })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn describe(&self) -> &'static str {
        if self.device.is_cuda() {
            "cuda"
        } else if self.device.is_metal() {
            "metal"
        } else {
            "cpu"
        }
    }
}

/// Trainable `D×D` projection applied on top of the frozen trunk.
pub(crate) struct EmbeddingHead {
    weight: Var,
    bias: Var,
}

impl EmbeddingHead {
    pub(crate) fn identity(dim: usize, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            weight: Var::from_tensor(&Tensor::eye(dim, DType::F32, device)?)?,
            bias: Var::zeros(dim, DType::F32, device)?,
        })
    }

    /// Independent copy, so a failed training run cannot touch the original.
    pub(crate) fn duplicate(&self) -> candle_core::Result<Self> {
        Ok(Self {
            weight: Var::from_tensor(&self.weight.as_tensor().copy()?)?,
            bias: Var::from_tensor(&self.bias.as_tensor().copy()?)?,
        })
    }

    pub(crate) fn vars(&self) -> Vec<Var> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.matmul(&self.weight.as_tensor().t()?)?
            .broadcast_add(self.bias.as_tensor())
    }

    pub(crate) fn load(path: &Path, dim: usize, device: &Device) -> Result<Self, EmbeddingError> {
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let (Some(weight), Some(bias)) = (tensors.remove(HEAD_WEIGHT), tensors.remove(HEAD_BIAS))
        else {
            return Err(EmbeddingError::InvalidConfig(format!(
                "{} does not contain an embedding head",
                path.display()
            )));
        };
        if weight.dims() != [dim, dim] || bias.dims() != [dim] {
            return Err(EmbeddingError::InvalidConfig(format!(
                "embedding head shape {:?} does not match trunk width {dim}",
                weight.dims()
            )));
        }
        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
        })
    }

    pub(crate) fn save(&self, path: &Path) -> Result<(), EmbeddingError> {
        let tensors = HashMap::from([
            (HEAD_WEIGHT.to_string(), self.weight.as_tensor().clone()),
            (HEAD_BIAS.to_string(), self.bias.as_tensor().clone()),
        ]);
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }
}

/// ResNet trunk with the classifier removed, plus an optional embedding head.
pub(crate) struct Backbone {
    kind: BackboneKind,
    trunk: Func<'static>,
    pub(crate) head: Option<EmbeddingHead>,
    pretrained: bool,
}

impl Backbone {
    pub(crate) fn load(cfg: &ExtractorConfig, ctx: &ExecutionContext) -> Result<Self, EmbeddingError> {
        let device = ctx.device();
        let mut random_init = None;
        let vb = match &cfg.weights_path {
            Some(path) => {
                if !path.is_file() {
                    return Err(EmbeddingError::InvalidConfig(format!(
                        "trunk weights not found: {}",
                        path.display()
                    )));
                }
                let tensors = candle_core::safetensors::load(path, device)?;
                VarBuilder::from_tensors(tensors, DType::F32, device)
            }
            None => {
                warn!(
                    backbone = cfg.backbone.as_str(),
                    seed = cfg.init_seed,
                    "no trunk weights configured, using random initialisation"
                );
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
                random_init = Some(varmap);
                vb
            }
        };

        let trunk = match cfg.backbone {
            BackboneKind::Resnet18 => resnet::resnet18_no_final_layer(vb)?,
            BackboneKind::Resnet34 => resnet::resnet34_no_final_layer(vb)?,
        };
        let pretrained = random_init.is_none();
        if let Some(varmap) = &random_init {
            reseed_conv_weights(varmap, cfg.init_seed)?;
        }

        let head = match &cfg.head_path {
            Some(path) => Some(EmbeddingHead::load(path, cfg.backbone.embedding_dim(), device)?),
            None => None,
        };

        info!(
            backbone = cfg.backbone.as_str(),
            pretrained,
            head = head.is_some(),
            device = ctx.describe(),
            "backbone ready"
        );

        Ok(Self {
            kind: cfg.backbone,
            trunk,
            head,
            pretrained,
        })
    }

    pub(crate) fn kind(&self) -> BackboneKind {
        self.kind
    }

    pub(crate) fn is_pretrained(&self) -> bool {
        self.pretrained
    }

    /// `(N, 3, S, S)` pixels to `(N, D)` trunk features.
    pub(crate) fn trunk_features(&self, pixels: &Tensor) -> candle_core::Result<Tensor> {
        self.trunk.forward(pixels)
    }

    pub(crate) fn embed(&self, pixels: &Tensor) -> candle_core::Result<Tensor> {
        let features = self.trunk_features(pixels)?;
        match &self.head {
            Some(head) => head.forward(&features),
            None => Ok(features),
        }
    }
}

/// Overwrite every convolution kernel with seeded `U(±1/√fan_in)` draws.
///
/// The kernels share storage with the tensors captured by the trunk, so the
/// trunk sees the new values. Batch-norm parameters keep their constant
/// initialisation.
fn reseed_conv_weights(varmap: &VarMap, seed: u64) -> candle_core::Result<()> {
    let data = varmap.data().lock().map_err(|_| {
        candle_core::Error::Msg("trunk parameter map lock poisoned".into())
    })?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();
        if dims.len() != 4 {
            continue;
        }
        let fan_in = dims[1] * dims[2] * dims[3];
        let bound = 1.0 / (fan_in as f32).sqrt();
        let values: Vec<f32> = (0..var.elem_count())
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        var.set(&Tensor::from_vec(values, dims.as_slice(), var.device())?)?;
    }
    Ok(())
}
