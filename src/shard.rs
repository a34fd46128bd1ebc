//! Flat-parameter sharding.
//!
//! Every wrapped block stores its parameters as one flattened buffer, padded
//! to a multiple of the world size and split into per-rank shards. The
//! shards are the at-rest representation; a forward pass gathers them into
//! the full buffer, views it as the per-parameter tensors, and drops the
//! view when the block returns. Gradients flow back through the gather, so
//! the backward pass needs no separate re-materialization step.
//!
//! Parameter names are dot-scoped paths in the `VarBuilder::pp` style
//! (`inner.qkv.weight`); a `ParamView` resolves them relative to its scope.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Tensor, Var};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{Result, ShardVitError};
use crate::memory::SharedMemoryTracker;
use crate::mesh::DeviceMesh;

const F32_BYTES: usize = 4;

/// Initializer for one parameter tensor.
///
/// Values are drawn from the caller's seeded rng, so a fixed seed fixes
/// the whole model's starting state.
#[derive(Debug, Clone, Copy)]
pub enum ParamInit {
    Const(f64),
    Uniform { lo: f64, up: f64 },
    Randn { mean: f64, stdev: f64 },
    /// Normal with stdev sqrt(2 / fan_in), the weight initializer
    /// `candle_nn::linear` uses
    KaimingNormal,
}

impl ParamInit {
    fn sample(&self, shape: &[usize], rng: &mut StdRng) -> Result<Vec<f32>> {
        let n: usize = shape.iter().product();
        match self {
            Self::Const(c) => Ok(vec![*c as f32; n]),
            Self::Uniform { lo, up } => Ok((0..n).map(|_| rng.gen_range(*lo..*up) as f32).collect()),
            Self::Randn { mean, stdev } => {
                let normal = Normal::new(*mean, *stdev)
                    .map_err(|e| ShardVitError::config(format!("bad normal init: {}", e)))?;
                Ok((0..n).map(|_| normal.sample(rng) as f32).collect())
            }
            Self::KaimingNormal => {
                let fan_in: usize = shape.iter().skip(1).product::<usize>().max(1);
                let stdev = (2.0 / fan_in as f64).sqrt();
                let normal = Normal::new(0.0, stdev)
                    .map_err(|e| ShardVitError::config(format!("bad normal init: {}", e)))?;
                Ok((0..n).map(|_| normal.sample(rng) as f32).collect())
            }
        }
    }
}

/// Declaration of one parameter tensor: scoped name, shape, initializer.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: ParamInit,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, init: ParamInit) -> Self {
        Self {
            name: name.into(),
            shape,
            init,
        }
    }

    /// Element count of this parameter
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Read-only view of materialized parameters, resolved by scoped name.
#[derive(Debug, Clone)]
pub struct ParamView {
    params: Arc<HashMap<String, Tensor>>,
    prefix: String,
}

impl ParamView {
    pub fn from_map(params: HashMap<String, Tensor>) -> Self {
        Self {
            params: Arc::new(params),
            prefix: String::new(),
        }
    }

    /// Scope the view under a path segment, like `VarBuilder::pp`.
    pub fn pp(&self, name: impl AsRef<str>) -> Self {
        let prefix = if self.prefix.is_empty() {
            name.as_ref().to_string()
        } else {
            format!("{}.{}", self.prefix, name.as_ref())
        };
        Self {
            params: Arc::clone(&self.params),
            prefix,
        }
    }

    /// Look up a parameter relative to the current scope.
    pub fn get(&self, name: &str) -> Result<Tensor> {
        let full = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        };
        self.params
            .get(&full)
            .cloned()
            .ok_or_else(|| ShardVitError::training(format!("parameter {} not materialized", full)))
    }
}

/// Parameter declarations for a linear layer under `scope`, using the same
/// initializers `candle_nn::linear` would.
pub fn linear_specs(scope: &str, in_dim: usize, out_dim: usize, bias: bool) -> Vec<ParamSpec> {
    let mut specs = vec![ParamSpec::new(
        format!("{}.weight", scope),
        vec![out_dim, in_dim],
        ParamInit::KaimingNormal,
    )];
    if bias {
        let bound = 1.0 / (in_dim as f64).sqrt();
        specs.push(ParamSpec::new(
            format!("{}.bias", scope),
            vec![out_dim],
            ParamInit::Uniform {
                lo: -bound,
                up: bound,
            },
        ));
    }
    specs
}

/// Apply a linear layer whose weight (and optional bias) live under the
/// view's current scope.
pub fn apply_linear(x: &Tensor, params: &ParamView, bias: bool) -> Result<Tensor> {
    let weight = params.get("weight")?;
    let bias = if bias { Some(params.get("bias")?) } else { None };
    let layer = candle_nn::Linear::new(weight, bias);
    Ok(candle_nn::Module::forward(&layer, x)?)
}

/// A module whose parameters live outside it, in a flat parameter.
///
/// Implementations hold geometry only. `param_specs` declares every tensor
/// the module needs; `forward_with` computes over a materialized view of
/// those tensors.
pub trait ShardableModule {
    fn param_specs(&self) -> Vec<ParamSpec>;
    fn forward_with(&self, x: &Tensor, params: &ParamView, train: bool) -> Result<Tensor>;
}

/// One block's parameters: flattened, padded, and split into per-rank shard
/// variables.
pub struct FlatParam {
    scope: String,
    specs: Vec<ParamSpec>,
    shards: Vec<(String, Var)>,
    total_len: usize,
    padded_len: usize,
    mesh: DeviceMesh,
    tracker: SharedMemoryTracker,
}

impl FlatParam {
    /// Flatten, pad, and shard the declared parameters.
    ///
    /// Initial values are drawn from `rng` per spec, concatenated in
    /// declaration order, and zero-padded up to a multiple of the world
    /// size. Each rank's slice becomes an independent trainable variable.
    /// The tracker records one worker's resident shard bytes.
    pub fn new(
        scope: impl Into<String>,
        specs: Vec<ParamSpec>,
        mesh: &DeviceMesh,
        tracker: &SharedMemoryTracker,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let scope = scope.into();
        if specs.is_empty() {
            return Err(ShardVitError::config(format!(
                "flat parameter {} declares no parameters",
                scope
            )));
        }

        let total_len: usize = specs.iter().map(|s| s.numel()).sum();
        let padded_len = mesh.padded_len(total_len);
        let mut values = Vec::with_capacity(padded_len);
        for spec in &specs {
            values.extend(spec.init.sample(&spec.shape, rng)?);
        }
        values.resize(padded_len, 0.0);
        let flat = Tensor::from_vec(values, padded_len, mesh.device())?;

        let mut shards = Vec::with_capacity(mesh.world_size());
        for rank in 0..mesh.world_size() {
            let slice = mesh.shard_of(&flat, rank)?;
            let name = format!("{}.flat.shard{}", scope, rank);
            shards.push((name, Var::from_tensor(&slice)?));
        }

        let this = Self {
            scope,
            specs,
            shards,
            total_len,
            padded_len,
            mesh: mesh.clone(),
            tracker: tracker.clone(),
        };
        if !this.tracker.allocate(this.shard_bytes()) {
            tracing::warn!(
                scope = this.scope.as_str(),
                current = this.tracker.current(),
                "resident shards alone exceed the configured parameter memory limit"
            );
        }
        Ok(this)
    }

    /// Bytes of one worker's resident shard
    pub fn shard_bytes(&self) -> usize {
        (self.padded_len / self.mesh.world_size()) * F32_BYTES
    }

    /// Bytes of the fully gathered flat buffer
    pub fn full_bytes(&self) -> usize {
        self.padded_len * F32_BYTES
    }

    /// Unpadded element count
    pub fn numel(&self) -> usize {
        self.total_len
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The shard variables, with their scoped names. These are what the
    /// optimizer updates.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        self.shards.clone()
    }

    /// Gather the shards into the full flat buffer and view it as the
    /// declared parameter tensors.
    ///
    /// The returned guard keeps the materialization overhead accounted for;
    /// dropping it re-shards. The gathered buffer stays on the autograd
    /// graph, so a backward pass through any viewed tensor reaches every
    /// shard.
    pub fn materialize(&self) -> Result<Materialized> {
        let shard_tensors: Vec<Tensor> = self
            .shards
            .iter()
            .map(|(_, v)| v.as_tensor().clone())
            .collect();
        let flat = self.mesh.all_gather(&shard_tensors)?;

        let mut params = HashMap::with_capacity(self.specs.len());
        let mut offset = 0;
        for spec in &self.specs {
            let n = spec.numel();
            let slice = flat.narrow(0, offset, n)?.reshape(spec.shape.clone())?;
            params.insert(spec.name.clone(), slice);
            offset += n;
        }

        let overhead = self.full_bytes() - self.shard_bytes();
        if !self.tracker.allocate(overhead) {
            tracing::warn!(
                scope = self.scope.as_str(),
                current = self.tracker.current(),
                "parameter memory over its configured limit after gather"
            );
        }
        Ok(Materialized {
            view: ParamView::from_map(params),
            tracker: self.tracker.clone(),
            overhead,
        })
    }
}

impl Drop for FlatParam {
    fn drop(&mut self) {
        self.tracker.release(self.shard_bytes());
    }
}

/// Guard over a materialized flat parameter. Dropping it returns the block
/// to its sharded representation.
pub struct Materialized {
    view: ParamView,
    tracker: SharedMemoryTracker,
    overhead: usize,
}

impl Materialized {
    pub fn view(&self) -> &ParamView {
        &self.view
    }
}

impl Drop for Materialized {
    fn drop(&mut self) {
        self.tracker.release(self.overhead);
    }
}

/// A shardable module paired with its flat parameter.
///
/// `forward` follows the reshard-after-forward discipline: materialize, run
/// the inner module, drop the materialized view before returning.
pub struct ShardedBlock<M> {
    inner: M,
    flat: FlatParam,
}

impl<M: ShardableModule> ShardedBlock<M> {
    pub fn new(
        scope: impl Into<String>,
        inner: M,
        mesh: &DeviceMesh,
        tracker: &SharedMemoryTracker,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let flat = FlatParam::new(scope, inner.param_specs(), mesh, tracker, rng)?;
        Ok(Self { inner, flat })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let materialized = self.flat.materialize()?;
        let out = self.inner.forward_with(x, materialized.view(), train);
        drop(materialized);
        out
    }

    pub fn named_vars(&self) -> Vec<(String, Var)> {
        self.flat.named_vars()
    }

    pub fn flat(&self) -> &FlatParam {
        &self.flat
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}
