//! Vision Transformer training with flat-parameter sharding.
//!
//! The model's parameters are flattened per block, padded, and split into
//! per-rank shards held by a worker group; forward passes gather each
//! block's shards just in time and re-shard as soon as the block returns.
//! Gradients flow back through the gather, get averaged across the group
//! at every sharding boundary, and the optimizer updates the local shards.
//!
//! The pieces:
//! - [`config`]: model geometry and training hyperparameters
//! - [`mesh`]: worker-group context and collective operations
//! - [`shard`]: flat parameters, shard variables, materialization
//! - [`patch`], [`attention`], [`mlp`], [`pooler`], [`norm`]: model blocks
//! - [`model`]: the assembled Vision Transformer
//! - [`optim`], [`data`], [`trainer`]: the training loop
//! - [`memory`]: parameter-memory accounting

pub mod attention;
pub mod config;
pub mod data;
pub mod error;
pub mod memory;
pub mod mesh;
pub mod mlp;
pub mod model;
pub mod norm;
pub mod optim;
pub mod patch;
pub mod pooler;
pub mod shard;
pub mod trainer;

pub use config::{TrainConfig, VitConfig};
pub use data::{Batch, BatchSource, SyntheticDataset};
pub use error::{Result, ShardVitError};
pub use memory::{format_bytes, MemoryTracker, SharedMemoryTracker};
pub use mesh::DeviceMesh;
pub use model::VisionTransformer;
pub use optim::{AdamW, Optimizer, OptimizerKind, Sgd};
pub use shard::{FlatParam, ParamInit, ParamSpec, ParamView, ShardableModule, ShardedBlock};
pub use trainer::{EpochStats, StepMetrics, Trainer};
