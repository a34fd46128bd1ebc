//! Training loop over a sharded Vision Transformer.

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::TrainConfig;
use crate::data::{Batch, BatchSource};
use crate::error::Result;
use crate::mesh::DeviceMesh;
use crate::model::VisionTransformer;
use crate::norm::log_softmax_last_dim;
use crate::optim::Optimizer;

/// Metrics from a single training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub epoch: usize,
    pub loss: f32,
}

/// Aggregated metrics for one epoch.
#[derive(Debug, Clone)]
pub struct EpochStats {
    pub epoch: usize,
    pub steps: usize,
    pub mean_loss: f32,
}

/// Drives epochs of forward / loss / backward / reduce / update over a
/// batch source.
///
/// Gradient synchronization happens at every sharding boundary: after
/// backward, each shard's gradient is passed through `all_reduce_avg` in
/// name-sorted order, the same sequence on every worker, before the
/// optimizer sees it. Logging and the progress bar are coordinator-only.
pub struct Trainer {
    model: VisionTransformer,
    optimizer: Box<dyn Optimizer>,
    mesh: DeviceMesh,
    config: TrainConfig,
    named_params: Vec<(String, Var)>,
    step: usize,
    epoch: usize,
    metrics: Vec<StepMetrics>,
}

impl Trainer {
    pub fn new(model: VisionTransformer, config: TrainConfig, mesh: DeviceMesh) -> Result<Self> {
        config.validate()?;
        let optimizer = config.optimizer.build(config.learning_rate);
        let named_params = model.named_vars();
        Ok(Self {
            model,
            optimizer,
            mesh,
            config,
            named_params,
            step: 0,
            epoch: 0,
            metrics: Vec::new(),
        })
    }

    pub fn model(&self) -> &VisionTransformer {
        &self.model
    }

    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn metrics(&self) -> &[StepMetrics] {
        &self.metrics
    }

    /// Per-step losses, in order
    pub fn losses(&self) -> Vec<f32> {
        self.metrics.iter().map(|m| m.loss).collect()
    }

    /// Mean cross-entropy over the batch
    fn cross_entropy(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let log_probs = log_softmax_last_dim(logits)?;
        Ok(candle_nn::loss::nll(&log_probs, labels)?)
    }

    /// One optimization step on one batch.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepMetrics> {
        self.optimizer.zero_grad();

        let logits = self.model.forward(&batch.images, true)?;
        let loss = self.cross_entropy(&logits, &batch.labels)?;
        let grad_store = loss.backward()?;

        // Reduce shard gradients in name order, identically on every worker
        let mut grads = HashMap::with_capacity(self.named_params.len());
        for (name, var) in &self.named_params {
            if let Some(grad) = grad_store.get(var) {
                grads.insert(name.clone(), self.mesh.all_reduce_avg(grad)?);
            }
        }
        self.optimizer.step(&self.named_params, &grads)?;

        self.step += 1;
        let metrics = StepMetrics {
            step: self.step,
            epoch: self.epoch,
            loss: loss.to_scalar::<f32>()?,
        };
        self.metrics.push(metrics.clone());
        Ok(metrics)
    }

    /// Run the configured number of epochs over the batch source.
    pub fn train(&mut self, data: &mut dyn BatchSource) -> Result<Vec<EpochStats>> {
        if self.mesh.is_coordinator() {
            tracing::info!("Starting training");
            tracing::info!("  World size: {}", self.mesh.world_size());
            tracing::info!("  Epochs: {}", self.config.epochs);
            tracing::info!("  Batch size: {}", self.config.batch_size);
            tracing::info!("  Learning rate: {:.2e}", self.optimizer.learning_rate());

            // One-time dataset materialization happens on the coordinator;
            // everyone else waits at the barrier and reads the cached copy
            data.prepare()?;
        }
        self.mesh.barrier();
        data.prepare()?;

        if self.mesh.is_coordinator() {
            tracing::info!("Loaded {} training examples", data.len());
        }

        let mut epoch_stats = Vec::with_capacity(self.config.epochs);
        for epoch in 0..self.config.epochs {
            self.epoch = epoch;
            let batches = data.batches(self.config.batch_size, self.config.seed + epoch as u64)?;

            let pb = if self.mesh.is_coordinator() {
                let pb = ProgressBar::new(batches.len() as u64);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("#>-"),
                );
                pb
            } else {
                ProgressBar::hidden()
            };

            let mut running_loss = 0.0f32;
            let mut running_steps = 0usize;
            let mut epoch_loss = 0.0f64;
            let mut epoch_steps = 0usize;

            for batch in &batches {
                let metrics = self.train_step(batch)?;
                running_loss += metrics.loss;
                running_steps += 1;
                epoch_loss += metrics.loss as f64;
                epoch_steps += 1;

                pb.set_message(format!("{:.4}", metrics.loss));
                pb.inc(1);

                if self.step % self.config.log_interval == 0 && self.mesh.is_coordinator() {
                    tracing::info!(
                        "Step {}, Epoch {}, Loss: {:.4}",
                        self.step,
                        epoch + 1,
                        running_loss / running_steps as f32,
                    );
                    // Running loss restarts after every log line
                    running_loss = 0.0;
                    running_steps = 0;
                }
            }

            pb.finish_and_clear();
            let stats = EpochStats {
                epoch,
                steps: epoch_steps,
                mean_loss: if epoch_steps > 0 {
                    (epoch_loss / epoch_steps as f64) as f32
                } else {
                    0.0
                },
            };
            if self.mesh.is_coordinator() {
                tracing::info!(
                    "Epoch {}/{} done, mean loss {:.4}",
                    epoch + 1,
                    self.config.epochs,
                    stats.mean_loss
                );
            }
            epoch_stats.push(stats);
        }
        Ok(epoch_stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VitConfig;
    use crate::data::SyntheticDataset;
    use crate::memory::SharedMemoryTracker;
    use candle_core::Device;

    fn trainer() -> Trainer {
        let mesh = DeviceMesh::single(Device::Cpu);
        let tracker = SharedMemoryTracker::new();
        let model = VisionTransformer::new(VitConfig::test(), &mesh, &tracker, 0).unwrap();
        Trainer::new(model, TrainConfig::test(), mesh).unwrap()
    }

    #[test]
    fn test_train_step_records_finite_loss() {
        let mut trainer = trainer();
        let mut data = SyntheticDataset::new(8, 4, 3, 32, 1, Device::Cpu);
        data.prepare().unwrap();
        let batch = &data.batches(8, 0).unwrap()[0];

        let metrics = trainer.train_step(batch).unwrap();
        assert_eq!(metrics.step, 1);
        assert!(metrics.loss.is_finite());
        assert!(metrics.loss >= 0.0);
        assert_eq!(trainer.losses().len(), 1);
    }

    #[test]
    fn test_steps_change_parameters() {
        let mut trainer = trainer();
        let mut data = SyntheticDataset::new(8, 4, 3, 32, 1, Device::Cpu);
        data.prepare().unwrap();
        let batch = &data.batches(8, 0).unwrap()[0];

        let before: Vec<f32> = trainer.model.named_vars()[0]
            .1
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        trainer.train_step(batch).unwrap();
        let after: Vec<f32> = trainer.model.named_vars()[0]
            .1
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_epoch_stats_accounting() {
        let mut trainer = trainer();
        let mut data = SyntheticDataset::new(16, 4, 3, 32, 1, Device::Cpu);
        let stats = trainer.train(&mut data).unwrap();

        // 16 examples / batch 8 = 2 steps per epoch, 2 epochs
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].steps, 2);
        assert_eq!(trainer.global_step(), 4);
        for s in &stats {
            assert!(s.mean_loss.is_finite());
        }
    }
}
