//! Multi-head self-attention with a fused QKV projection.

use candle_core::Tensor;
use candle_nn::Dropout;

use crate::error::Result;
use crate::norm::softmax_last_dim;
use crate::shard::{apply_linear, linear_specs, ParamSpec, ParamView, ShardableModule};

/// Scaled dot-product multi-head attention.
///
/// Q, K, V come from one fused projection of width `3 * heads * head_dim`
/// with no bias. When a single head already spans the model width the
/// output projection is omitted entirely; the decision is made at
/// construction, so the parameter set is fixed. Dropout applies after the
/// output projection only, so the softmax weights stay row-stochastic in
/// train mode and the projection-free configuration is deterministic.
pub struct Attention {
    dim: usize,
    heads: usize,
    head_dim: usize,
    scale: f64,
    project_out: bool,
    dropout: Dropout,
}

impl Attention {
    pub fn new(dim: usize, heads: usize, head_dim: usize, dropout: f32) -> Self {
        let project_out = !(heads == 1 && head_dim == dim);
        Self {
            dim,
            heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            project_out,
            dropout: Dropout::new(dropout),
        }
    }

    fn inner_dim(&self) -> usize {
        self.heads * self.head_dim
    }

    /// Project x to per-head Q, K, V tensors of shape [b, heads, n, head_dim]
    fn qkv_heads(&self, x: &Tensor, params: &ParamView) -> Result<(Tensor, Tensor, Tensor)> {
        let (b, n, _) = x.dims3()?;
        let inner = self.inner_dim();
        let qkv = apply_linear(x, &params.pp("qkv"), false)?;

        let split = |offset: usize| -> Result<Tensor> {
            let part = qkv.narrow(2, offset * inner, inner)?;
            Ok(part
                .reshape((b, n, self.heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        Ok((split(0)?, split(1)?, split(2)?))
    }

    /// Row-stochastic attention weights [b, heads, n, n]
    pub fn attention_weights(&self, x: &Tensor, params: &ParamView) -> Result<Tensor> {
        let (q, k, _) = self.qkv_heads(x, params)?;
        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        softmax_last_dim(&scores)
    }
}

impl ShardableModule for Attention {
    fn param_specs(&self) -> Vec<ParamSpec> {
        let mut specs = linear_specs("qkv", self.dim, 3 * self.inner_dim(), false);
        if self.project_out {
            specs.extend(linear_specs("out", self.inner_dim(), self.dim, true));
        }
        specs
    }

    fn forward_with(&self, x: &Tensor, params: &ParamView, train: bool) -> Result<Tensor> {
        let (b, n, _) = x.dims3()?;
        let (q, k, v) = self.qkv_heads(x, params)?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let attn = softmax_last_dim(&scores)?;

        let out = attn.matmul(&v)?;
        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, self.inner_dim()))?;

        if self.project_out {
            let out = apply_linear(&out, &params.pp("out"), true)?;
            Ok(self.dropout.forward(&out, train)?)
        } else {
            Ok(out)
        }
    }
}
