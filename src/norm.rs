//! Normalization primitives over parameter views.
//!
//! Layer norm and softmax are expressed with basic tensor operations (mean,
//! variance, broadcast arithmetic) so they run on any backend without
//! depending on fused kernels. The parameters live in a flat parameter and
//! arrive through a `ParamView`, so the functions here are free functions
//! rather than weight-holding structs.

use candle_core::{Tensor, D};

use crate::error::Result;
use crate::shard::{ParamInit, ParamSpec, ParamView, ShardableModule};

/// Layer norm: y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
pub fn layer_norm(x: &Tensor, weight: &Tensor, bias: &Tensor, eps: f64) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let x_centered = x.broadcast_sub(&mean)?;
    let var = x_centered.sqr()?.mean_keepdim(D::Minus1)?;
    let std = (var + eps)?.sqrt()?;
    let normalized = x_centered.broadcast_div(&std)?;
    Ok(normalized.broadcast_mul(weight)?.broadcast_add(bias)?)
}

/// Parameter declarations for one layer norm under `scope`
pub fn norm_specs(scope: &str, dim: usize) -> Vec<ParamSpec> {
    vec![
        ParamSpec::new(format!("{}.weight", scope), vec![dim], ParamInit::Const(1.0)),
        ParamSpec::new(format!("{}.bias", scope), vec![dim], ParamInit::Const(0.0)),
    ]
}

/// Apply a layer norm whose weight/bias live under the view's current scope
pub fn apply_norm(x: &Tensor, params: &ParamView, eps: f64) -> Result<Tensor> {
    let weight = params.get("weight")?;
    let bias = params.get("bias")?;
    layer_norm(x, &weight, &bias, eps)
}

/// Softmax over the last dimension with max-subtraction stabilization.
///
/// softmax(x) = exp(x - max(x)) / sum(exp(x - max(x)))
pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let x_shifted = x.broadcast_sub(&max)?;
    let exp_x = x_shifted.exp()?;
    let sum_exp = exp_x.sum_keepdim(D::Minus1)?;
    Ok(exp_x.broadcast_div(&sum_exp)?)
}

/// log_softmax(x) = x - max(x) - log(sum(exp(x - max(x))))
pub fn log_softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let x_shifted = x.broadcast_sub(&max)?;
    let log_sum_exp = x_shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    Ok(x_shifted.broadcast_sub(&log_sum_exp)?)
}

/// Prefix a set of parameter declarations with a scope segment
pub fn scoped_specs(scope: &str, specs: Vec<ParamSpec>) -> Vec<ParamSpec> {
    specs
        .into_iter()
        .map(|s| ParamSpec::new(format!("{}.{}", scope, s.name), s.shape, s.init))
        .collect()
}

/// Normalize-then-apply wrapper. Output is `inner(layer_norm(x))`; the
/// residual addition is the caller's responsibility.
pub struct PreNorm<M> {
    dim: usize,
    eps: f64,
    inner: M,
}

impl<M> PreNorm<M> {
    pub fn new(dim: usize, eps: f64, inner: M) -> Self {
        Self { dim, eps, inner }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

impl<M: ShardableModule> ShardableModule for PreNorm<M> {
    fn param_specs(&self) -> Vec<ParamSpec> {
        let mut specs = norm_specs("norm", self.dim);
        specs.extend(scoped_specs("inner", self.inner.param_specs()));
        specs
    }

    fn forward_with(&self, x: &Tensor, params: &ParamView, train: bool) -> Result<Tensor> {
        let normed = apply_norm(x, &params.pp("norm"), self.eps)?;
        self.inner.forward_with(&normed, &params.pp("inner"), train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::collections::HashMap;

    #[test]
    fn test_layer_norm_normalizes() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (2, 64), &device).unwrap();
        let weight = Tensor::ones(64, candle_core::DType::F32, &device).unwrap();
        let bias = Tensor::zeros(64, candle_core::DType::F32, &device).unwrap();

        let out = layer_norm(&x, &weight, &bias, 1e-5).unwrap();
        assert_eq!(out.dims(), &[2, 64]);

        let mean = out.mean_all().unwrap().to_scalar::<f32>().unwrap();
        let var = out.sqr().unwrap().mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(mean.abs() < 0.1, "mean should be near 0, got {}", mean);
        assert!((var - 1.0).abs() < 0.1, "variance should be near 1, got {}", var);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 4.0, (3, 5, 7), &device).unwrap();
        let sm = softmax_last_dim(&x).unwrap();
        let sums = sm.sum(D::Minus1).unwrap().flatten_all().unwrap();
        for s in sums.to_vec1::<f32>().unwrap() {
            assert!((s - 1.0).abs() < 1e-5, "row sum {} != 1", s);
        }
    }

    #[test]
    fn test_softmax_stable_for_large_logits() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1000.0f32, 1001.0, 1002.0]], &device).unwrap();
        let sm = softmax_last_dim(&x).unwrap();
        for v in sm.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!(v.is_finite());
        }
    }

    struct Identity;

    impl ShardableModule for Identity {
        fn param_specs(&self) -> Vec<ParamSpec> {
            vec![ParamSpec::new("w", vec![1], ParamInit::Const(1.0))]
        }

        fn forward_with(&self, x: &Tensor, params: &ParamView, _train: bool) -> Result<Tensor> {
            let w = params.get("w")?;
            Ok(x.broadcast_mul(&w)?)
        }
    }

    #[test]
    fn test_pre_norm_scopes_parameters() {
        let wrapped = PreNorm::new(4, 1e-5, Identity);
        let names: Vec<String> = wrapped.param_specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["norm.weight", "norm.bias", "inner.w"]);

        let device = Device::Cpu;
        let mut map = HashMap::new();
        map.insert(
            "norm.weight".to_string(),
            Tensor::ones(4, candle_core::DType::F32, &device).unwrap(),
        );
        map.insert(
            "norm.bias".to_string(),
            Tensor::zeros(4, candle_core::DType::F32, &device).unwrap(),
        );
        map.insert(
            "inner.w".to_string(),
            Tensor::ones(1, candle_core::DType::F32, &device).unwrap(),
        );
        let view = ParamView::from_map(map);

        let x = Tensor::randn(0.0f32, 1.0, (2, 3, 4), &device).unwrap();
        let out = wrapped.forward_with(&x, &view, false).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);
    }
}
