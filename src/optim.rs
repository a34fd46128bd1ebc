//! Optimizers over named shard variables.
//!
//! The trainer synchronizes gradients before updating, so the optimizer
//! receives them as an explicit name-keyed map instead of reading a
//! `GradStore` itself. Both families update `Var`s in place via `set`.

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Update contract the training loop drives.
pub trait Optimizer {
    /// Clear accumulated gradients. Backward passes here produce a fresh
    /// gradient store each step, so there is nothing to clear; the method
    /// exists so the loop's reset-compute-step shape is explicit.
    fn zero_grad(&mut self);

    /// Apply one update to every parameter that has a gradient.
    fn step(&mut self, params: &[(String, Var)], grads: &HashMap<String, Tensor>) -> Result<()>;

    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
}

/// Optimizer family, chosen at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    AdamW,
}

impl OptimizerKind {
    pub fn build(&self, learning_rate: f64) -> Box<dyn Optimizer> {
        match self {
            Self::Sgd => Box::new(Sgd::new(learning_rate)),
            Self::AdamW => Box::new(AdamW::new(learning_rate)),
        }
    }
}

/// Plain stochastic gradient descent
pub struct Sgd {
    learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn zero_grad(&mut self) {}

    fn step(&mut self, params: &[(String, Var)], grads: &HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in params {
            if let Some(grad) = grads.get(name) {
                let updated = (var.as_tensor() - (grad * self.learning_rate)?)?;
                var.set(&updated)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

/// AdamW with decoupled weight decay and bias-corrected moments, keyed by
/// parameter name.
pub struct AdamW {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    t: usize,
    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,
}

impl AdamW {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for AdamW {
    fn zero_grad(&mut self) {}

    fn step(&mut self, params: &[(String, Var)], grads: &HashMap<String, Tensor>) -> Result<()> {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for (name, var) in params {
            let Some(grad) = grads.get(name) else {
                continue;
            };

            let m = match self.m.get(name) {
                Some(m) => ((m * self.beta1)? + (grad * (1.0 - self.beta1))?)?,
                None => (grad * (1.0 - self.beta1))?,
            };
            let v = match self.v.get(name) {
                Some(v) => ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?,
                None => (grad.sqr()? * (1.0 - self.beta2))?,
            };

            let m_hat = (&m / bc1)?;
            let v_hat = (&v / bc2)?;
            let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;

            let mut weights = var.as_tensor().clone();
            if self.weight_decay > 0.0 {
                weights = (weights * (1.0 - self.learning_rate * self.weight_decay))?;
            }
            let updated = (weights - (update * self.learning_rate)?)?;
            var.set(&updated)?;

            self.m.insert(name.clone(), m);
            self.v.insert(name.clone(), v);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}
