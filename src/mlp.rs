//! Position-wise feed-forward network.

use candle_core::Tensor;
use candle_nn::Dropout;

use crate::error::Result;
use crate::shard::{apply_linear, linear_specs, ParamSpec, ParamView, ShardableModule};

/// Two-layer MLP applied at every sequence position:
/// linear(dim -> mlp_dim), GELU, dropout, linear(mlp_dim -> dim), dropout.
pub struct FeedForward {
    dim: usize,
    mlp_dim: usize,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(dim: usize, mlp_dim: usize, dropout: f32) -> Self {
        Self {
            dim,
            mlp_dim,
            dropout: Dropout::new(dropout),
        }
    }
}

impl ShardableModule for FeedForward {
    fn param_specs(&self) -> Vec<ParamSpec> {
        let mut specs = linear_specs("fc1", self.dim, self.mlp_dim, true);
        specs.extend(linear_specs("fc2", self.mlp_dim, self.dim, true));
        specs
    }

    fn forward_with(&self, x: &Tensor, params: &ParamView, train: bool) -> Result<Tensor> {
        let h = apply_linear(x, &params.pp("fc1"), true)?;
        let h = h.gelu()?;
        let h = self.dropout.forward(&h, train)?;
        let h = apply_linear(&h, &params.pp("fc2"), true)?;
        Ok(self.dropout.forward(&h, train)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedMemoryTracker;
    use crate::mesh::DeviceMesh;
    use crate::shard::ShardedBlock;
    use candle_core::{Device, Tensor};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_feed_forward_shape() {
        let device = Device::Cpu;
        let mesh = DeviceMesh::single(device.clone());
        let tracker = SharedMemoryTracker::new();
        let ffn = FeedForward::new(16, 32, 0.0);
        let mut rng = StdRng::seed_from_u64(0);
        let block = ShardedBlock::new("ffn", ffn, &mesh, &tracker, &mut rng).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (2, 5, 16), &device).unwrap();
        let out = block.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[2, 5, 16]);
    }

    #[test]
    fn test_parameter_declarations() {
        let ffn = FeedForward::new(8, 16, 0.1);
        let specs = ffn.param_specs();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fc1.weight", "fc1.bias", "fc2.weight", "fc2.bias"]);
        assert_eq!(specs[0].shape, vec![16, 8]);
        assert_eq!(specs[2].shape, vec![8, 16]);
    }
}
