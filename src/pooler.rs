//! Attention pooling: collapse a variable-length token sequence into one
//! feature vector with a learned query.

use candle_core::Tensor;

use crate::error::Result;
use crate::norm::softmax_last_dim;
use crate::shard::{apply_linear, linear_specs, ParamInit, ParamSpec, ParamView, ShardableModule};

/// Single-query attention pool. One learned query attends over every
/// position; the output is [b, dim] regardless of sequence length.
pub struct AttnPooler {
    dim: usize,
    scale: f64,
}

impl AttnPooler {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            scale: (dim as f64).powf(-0.5),
        }
    }
}

impl ShardableModule for AttnPooler {
    fn param_specs(&self) -> Vec<ParamSpec> {
        let mut specs = vec![ParamSpec::new(
            "query",
            vec![1, 1, self.dim],
            ParamInit::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )];
        specs.extend(linear_specs("to_k", self.dim, self.dim, true));
        specs.extend(linear_specs("to_v", self.dim, self.dim, true));
        specs
    }

    fn forward_with(&self, x: &Tensor, params: &ParamView, _train: bool) -> Result<Tensor> {
        let q = params.get("query")?;
        let k = apply_linear(x, &params.pp("to_k"), true)?;
        let v = apply_linear(x, &params.pp("to_v"), true)?;

        // [1, 1, dim] x [b, dim, n] -> [b, 1, n]
        let scores = (q.broadcast_matmul(&k.t()?)? * self.scale)?;
        let attn = softmax_last_dim(&scores)?;

        // [b, 1, n] x [b, n, dim] -> [b, dim]
        Ok(attn.matmul(&v)?.squeeze(1)?)
    }
}
