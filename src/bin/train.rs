//! Train a sharded Vision Transformer on synthetic data.
//!
//! Demo binary: builds the model from CLI flags, reports its parameter
//! footprint, and runs the training loop end to end. Real dataset
//! acquisition plugs in behind the `BatchSource` trait.

use anyhow::Context;
use candle_core::Device;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use shardvit_rs::{
    format_bytes, DeviceMesh, OptimizerKind, SharedMemoryTracker, SyntheticDataset, TrainConfig,
    Trainer, VisionTransformer, VitConfig,
};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train a sharded Vision Transformer")]
struct Args {
    /// Number of workers the parameters are sharded across
    #[arg(long, default_value_t = 1)]
    world_size: usize,

    /// This worker's rank
    #[arg(long, default_value_t = 0)]
    rank: usize,

    /// Examples per batch
    #[arg(long, default_value_t = 512)]
    batch_size: usize,

    /// Number of epochs
    #[arg(long, default_value_t = 2)]
    epochs: usize,

    /// Learning rate
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,

    /// Optimizer: sgd or adam_w
    #[arg(long, default_value = "adam_w")]
    optimizer: String,

    /// Synthetic dataset size
    #[arg(long, default_value_t = 4096)]
    examples: usize,

    /// Log every N steps
    #[arg(long, default_value_t = 50)]
    log_interval: usize,

    /// RNG seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Force CPU even when CUDA is available
    #[arg(long)]
    cpu: bool,

    /// Model configuration JSON; defaults to the CIFAR-10 preset
    #[arg(long)]
    model_config: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let optimizer = match args.optimizer.as_str() {
        "sgd" => OptimizerKind::Sgd,
        "adam_w" => OptimizerKind::AdamW,
        other => anyhow::bail!("unknown optimizer {:?}, expected sgd or adam_w", other),
    };

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0).context("device selection")?
    };
    let mesh = DeviceMesh::init(args.world_size, args.rank, device.clone())
        .context("process group bootstrap")?;

    let vit_config = match &args.model_config {
        Some(path) => VitConfig::from_file(path).context("loading model config")?,
        None => VitConfig::cifar10(),
    };
    let train_config = TrainConfig {
        world_size: args.world_size,
        batch_size: args.batch_size,
        learning_rate: args.lr,
        epochs: args.epochs,
        log_interval: args.log_interval,
        seed: args.seed,
        optimizer,
    };

    let tracker = SharedMemoryTracker::new();
    let model = VisionTransformer::new(vit_config.clone(), &mesh, &tracker, args.seed)
        .context("model construction")?;

    if mesh.is_coordinator() {
        tracing::info!("Model: {} layers, dim {}", vit_config.num_layers, vit_config.dim());
        tracing::info!(
            "Parameters: {} ({} fp32)",
            model.num_parameters(),
            format_bytes(model.num_parameters() * 4)
        );
        tracing::info!(
            "Resident shard memory per worker: {}",
            format_bytes(model.resident_shard_bytes())
        );
        tracing::info!(
            "Peak materialized bound: {}",
            format_bytes(model.peak_materialized_bound())
        );
    }

    let mut data = SyntheticDataset::new(
        args.examples,
        vit_config.num_classes,
        vit_config.in_channels,
        vit_config.image_size,
        args.seed,
        device,
    );

    let mut trainer = Trainer::new(model, train_config, mesh.clone())?;
    let stats = trainer.train(&mut data).context("training run")?;

    if mesh.is_coordinator() {
        for s in &stats {
            tracing::info!("epoch {}: mean loss {:.4} over {} steps", s.epoch + 1, s.mean_loss, s.steps);
        }
        tracing::info!(
            "Peak tracked parameter memory: {}",
            format_bytes(tracker.peak())
        );
    }
    Ok(())
}
