//! Model and training configuration.
//!
//! `VitConfig` fixes the model geometry at construction time; `TrainConfig`
//! carries the training-loop and worker-group knobs. Both serialize to JSON
//! for reproducibility.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardVitError};
use crate::optim::OptimizerKind;

/// Configuration for the Vision Transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VitConfig {
    /// Number of transformer layers
    pub num_layers: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Feature width of one attention head
    pub head_dim: usize,
    /// FFN expansion multiplier (mlp_dim = dim * mlp_mult)
    pub mlp_mult: usize,
    /// Dropout probability inside attention/FFN blocks
    pub dropout: f32,
    /// Dropout probability applied after the positional embedding
    pub emb_dropout: f32,
    /// Number of output classes
    pub num_classes: usize,
    /// Input image channels
    pub in_channels: usize,
    /// Side length of one square patch
    pub patch_size: usize,
    /// Side length of the (square) input image
    pub image_size: usize,
    /// Layer norm epsilon
    pub layer_norm_eps: f64,
}

impl Default for VitConfig {
    fn default() -> Self {
        Self::cifar10()
    }
}

impl VitConfig {
    /// Configuration matching the CIFAR-10 reference run.
    pub fn cifar10() -> Self {
        Self {
            num_layers: 8,
            num_heads: 8,
            head_dim: 64,
            mlp_mult: 4,
            dropout: 0.1,
            emb_dropout: 0.1,
            num_classes: 10,
            in_channels: 3,
            patch_size: 4,
            image_size: 32,
            layer_norm_eps: 1e-5,
        }
    }

    /// Minimal configuration for unit tests.
    pub fn test() -> Self {
        Self {
            num_layers: 2,
            num_heads: 2,
            head_dim: 8,
            mlp_mult: 2,
            dropout: 0.0,
            emb_dropout: 0.0,
            num_classes: 4,
            in_channels: 3,
            patch_size: 8,
            image_size: 32,
            layer_norm_eps: 1e-5,
        }
    }

    /// Embedding dimension
    pub fn dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// FFN hidden dimension
    pub fn mlp_dim(&self) -> usize {
        self.dim() * self.mlp_mult
    }

    /// Number of patch positions per image
    pub fn num_patches(&self) -> usize {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }

    /// Flattened size of one patch (channels * patch_h * patch_w)
    pub fn patch_dim(&self) -> usize {
        self.in_channels * self.patch_size * self.patch_size
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `Config` if any dimension is zero or the image is not an
    /// integer number of patches.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0
            || self.num_heads == 0
            || self.head_dim == 0
            || self.mlp_mult == 0
            || self.num_classes == 0
            || self.in_channels == 0
        {
            return Err(ShardVitError::config("all model dimensions must be non-zero"));
        }
        if self.patch_size == 0 || self.image_size == 0 {
            return Err(ShardVitError::config("patch_size and image_size must be non-zero"));
        }
        if self.image_size % self.patch_size != 0 {
            return Err(ShardVitError::config(format!(
                "image_size {} is not divisible by patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) || !(0.0..1.0).contains(&self.emb_dropout) {
            return Err(ShardVitError::config("dropout rates must be in [0, 1)"));
        }
        Ok(())
    }

    /// Estimate total parameter count.
    pub fn parameter_count(&self) -> usize {
        let dim = self.dim();
        let inner = dim; // inner_dim == heads * head_dim == dim here
        let project_out = !(self.num_heads == 1 && self.head_dim == dim);

        let patch_embed = self.patch_dim() * dim + dim + 2 * dim; // proj + post-norm
        let pos = self.num_patches() * dim;

        let attn = 2 * dim // pre-norm
            + 3 * inner * dim // fused qkv, no bias
            + if project_out { dim * inner + dim } else { 0 };
        let ffn = 2 * dim // pre-norm
            + dim * self.mlp_dim() + self.mlp_dim()
            + self.mlp_dim() * dim + dim;
        let pooler = 2 * (dim * dim + dim) + dim; // to_k, to_v, query
        let head = dim * self.num_classes + self.num_classes;

        patch_embed + pos + self.num_layers * (attn + ffn) + 2 * dim + pooler + head
    }

    /// Estimate parameter memory in bytes (FP32).
    pub fn memory_estimate_fp32(&self) -> usize {
        self.parameter_count() * 4
    }

    /// Load from a JSON file and validate.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty-printed JSON.
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Configuration for the training loop and worker group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Number of workers the parameters are sharded across
    pub world_size: usize,
    /// Examples per batch (per worker)
    pub batch_size: usize,
    /// Optimizer learning rate
    pub learning_rate: f64,
    /// Number of passes over the dataset
    pub epochs: usize,
    /// Emit a loss log line every this many steps
    pub log_interval: usize,
    /// Seed for data shuffling and synthetic data
    pub seed: u64,
    /// Optimizer family, resolved at configuration time
    pub optimizer: OptimizerKind,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            batch_size: 512,
            learning_rate: 1e-3,
            epochs: 2,
            log_interval: 2000,
            seed: 42,
            optimizer: OptimizerKind::AdamW,
        }
    }
}

impl TrainConfig {
    /// Minimal configuration for unit tests.
    pub fn test() -> Self {
        Self {
            world_size: 1,
            batch_size: 8,
            learning_rate: 1e-3,
            epochs: 2,
            log_interval: 10,
            seed: 42,
            optimizer: OptimizerKind::AdamW,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(ShardVitError::config("world_size must be at least 1"));
        }
        if self.batch_size == 0 || self.epochs == 0 {
            return Err(ShardVitError::config("batch_size and epochs must be non-zero"));
        }
        if self.log_interval == 0 {
            return Err(ShardVitError::config("log_interval must be non-zero"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ShardVitError::config("learning_rate must be positive and finite"));
        }
        Ok(())
    }
}
