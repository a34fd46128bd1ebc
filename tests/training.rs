//! End-to-end training scenarios on synthetic data.

use candle_core::Device;
use shardvit_rs::{
    DeviceMesh, SharedMemoryTracker, SyntheticDataset, TrainConfig, Trainer, VisionTransformer,
    VitConfig,
};

fn small_config(num_classes: usize) -> VitConfig {
    let mut config = VitConfig::test();
    config.num_classes = num_classes;
    config
}

fn build_trainer(world_size: usize, config: VitConfig, train: TrainConfig) -> Trainer {
    let mesh = DeviceMesh::init(world_size, 0, Device::Cpu).unwrap();
    let tracker = SharedMemoryTracker::new();
    let model = VisionTransformer::new(config, &mesh, &tracker, 0).unwrap();
    Trainer::new(model, train, mesh).unwrap()
}

#[test]
fn full_batch_produces_ten_class_logits_and_finite_loss() {
    let config = small_config(10);
    let mesh = DeviceMesh::single(Device::Cpu);
    let tracker = SharedMemoryTracker::new();
    let model = VisionTransformer::new(config.clone(), &mesh, &tracker, 0).unwrap();

    let mut data = SyntheticDataset::new(512, 10, 3, 32, 11, Device::Cpu);
    let mut trainer = Trainer::new(
        model,
        TrainConfig {
            batch_size: 512,
            epochs: 1,
            ..TrainConfig::test()
        },
        mesh,
    )
    .unwrap();

    use shardvit_rs::BatchSource;
    data.prepare().unwrap();
    let batches = data.batches(512, 0).unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].images.dims(), &[512, 3, 32, 32]);

    let logits = trainer.model().forward(&batches[0].images, false).unwrap();
    assert_eq!(logits.dims(), &[512, 10]);

    let metrics = trainer.train_step(&batches[0]).unwrap();
    assert!(metrics.loss.is_finite());
    assert!(metrics.loss >= 0.0);
}

#[test]
fn two_epochs_do_not_increase_mean_loss() {
    for world_size in [1usize, 2] {
        let train = TrainConfig {
            world_size,
            batch_size: 16,
            learning_rate: 3e-3,
            epochs: 2,
            log_interval: 100,
            seed: 5,
            ..TrainConfig::test()
        };
        let mut trainer = build_trainer(world_size, small_config(4), train);
        let mut data = SyntheticDataset::new(256, 4, 3, 32, 5, Device::Cpu);

        let stats = trainer.train(&mut data).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].steps, 16);
        assert!(
            stats[1].mean_loss <= stats[0].mean_loss,
            "world_size {}: epoch losses increased, {:.4} -> {:.4}",
            world_size,
            stats[0].mean_loss,
            stats[1].mean_loss
        );
    }
}

#[test]
fn sharded_memory_bound_holds_through_training() {
    let mesh = DeviceMesh::init(4, 0, Device::Cpu).unwrap();
    let tracker = SharedMemoryTracker::new();
    let model = VisionTransformer::new(small_config(4), &mesh, &tracker, 0).unwrap();
    let resident = model.resident_shard_bytes();
    let bound = model.peak_materialized_bound();

    let mut trainer = Trainer::new(
        model,
        TrainConfig {
            world_size: 4,
            batch_size: 8,
            epochs: 1,
            ..TrainConfig::test()
        },
        mesh,
    )
    .unwrap();
    let mut data = SyntheticDataset::new(32, 4, 3, 32, 9, Device::Cpu);
    trainer.train(&mut data).unwrap();

    // Parameters are back at rest in shards, and the peak stayed within
    // root + one gathered block over the sharded residue
    assert_eq!(tracker.current(), resident);
    assert!(tracker.peak() <= bound);
}
