//! Batch sources for training.
//!
//! Dataset acquisition is external to the core; the trainer only needs
//! something that can be materialized once and then sliced into shuffled
//! batches. `SyntheticDataset` is the in-crate implementation used by tests
//! and the demo binary.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{Result, ShardVitError};

/// One training batch: images [b, c, h, w] f32 and labels [b] u32.
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }
}

/// A dataset the trainer can iterate over in epochs.
pub trait BatchSource {
    /// One-time materialization (download, decode, cache). The coordinator
    /// calls this before the group barrier; it must be idempotent.
    fn prepare(&mut self) -> Result<()>;

    /// Number of examples
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuffled batches for one epoch. The same seed yields the same
    /// sequence of batches; the final batch may be short.
    fn batches(&self, batch_size: usize, seed: u64) -> Result<Vec<Batch>>;
}

/// Seeded synthetic image dataset with a learnable class signal.
///
/// Each image is noise around a per-class mean, so a classifier can reduce
/// loss on it; generation is fully determined by the seed.
pub struct SyntheticDataset {
    num_examples: usize,
    num_classes: usize,
    in_channels: usize,
    image_size: usize,
    seed: u64,
    device: Device,
    pixels: Vec<f32>,
    labels: Vec<u32>,
}

impl SyntheticDataset {
    pub fn new(
        num_examples: usize,
        num_classes: usize,
        in_channels: usize,
        image_size: usize,
        seed: u64,
        device: Device,
    ) -> Self {
        Self {
            num_examples,
            num_classes,
            in_channels,
            image_size,
            seed,
            device,
            pixels: Vec::new(),
            labels: Vec::new(),
        }
    }

    fn example_len(&self) -> usize {
        self.in_channels * self.image_size * self.image_size
    }
}

impl BatchSource for SyntheticDataset {
    fn prepare(&mut self) -> Result<()> {
        if !self.labels.is_empty() {
            return Ok(());
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let example_len = self.example_len();
        self.pixels.reserve(self.num_examples * example_len);
        self.labels.reserve(self.num_examples);

        for _ in 0..self.num_examples {
            let label = rng.gen_range(0..self.num_classes as u32);
            // Class-dependent mean in [-0.5, 0.5] plus uniform noise
            let mean = label as f32 / self.num_classes as f32 - 0.5;
            for _ in 0..example_len {
                self.pixels.push(mean + rng.gen_range(-0.5..0.5));
            }
            self.labels.push(label);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn batches(&self, batch_size: usize, seed: u64) -> Result<Vec<Batch>> {
        if self.labels.is_empty() {
            return Err(ShardVitError::data("dataset not prepared"));
        }
        if batch_size == 0 {
            return Err(ShardVitError::data("batch_size must be non-zero"));
        }

        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));

        let example_len = self.example_len();
        let mut batches = Vec::with_capacity(self.len().div_ceil(batch_size));
        for chunk in order.chunks(batch_size) {
            let mut pixels = Vec::with_capacity(chunk.len() * example_len);
            let mut labels = Vec::with_capacity(chunk.len());
            for &i in chunk {
                pixels.extend_from_slice(&self.pixels[i * example_len..(i + 1) * example_len]);
                labels.push(self.labels[i]);
            }
            let images = Tensor::from_vec(
                pixels,
                (chunk.len(), self.in_channels, self.image_size, self.image_size),
                &self.device,
            )?;
            let labels = Tensor::from_vec(labels, chunk.len(), &self.device)?;
            batches.push(Batch { images, labels });
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(n: usize) -> SyntheticDataset {
        SyntheticDataset::new(n, 4, 3, 16, 7, Device::Cpu)
    }

    #[test]
    fn test_prepare_then_batch_shapes() {
        let mut data = dataset(20);
        data.prepare().unwrap();
        assert_eq!(data.len(), 20);

        let batches = data.batches(8, 1).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].images.dims(), &[8, 3, 16, 16]);
        assert_eq!(batches[0].labels.dims(), &[8]);
        // Short final batch is kept
        assert_eq!(batches[2].batch_size(), 4);
    }

    #[test]
    fn test_batches_before_prepare_fail() {
        let data = dataset(10);
        assert!(data.batches(4, 0).is_err());
    }

    #[test]
    fn test_same_seed_same_batches() {
        let mut data = dataset(16);
        data.prepare().unwrap();

        let first_image = |batches: &[Batch]| -> Vec<f32> {
            batches[0].images.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };

        let a = data.batches(4, 3).unwrap();
        let b = data.batches(4, 3).unwrap();
        assert_eq!(first_image(&a), first_image(&b));
        assert_eq!(
            a[0].labels.to_vec1::<u32>().unwrap(),
            b[0].labels.to_vec1::<u32>().unwrap()
        );

        // A different epoch seed reshuffles
        let c = data.batches(4, 4).unwrap();
        assert_ne!(first_image(&a), first_image(&c));
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let mut data = dataset(10);
        data.prepare().unwrap();
        let first: Vec<u32> = data.labels.clone();
        data.prepare().unwrap();
        assert_eq!(data.labels, first);
        assert_eq!(data.len(), 10);
    }

    #[test]
    fn test_labels_in_range() {
        let mut data = dataset(50);
        data.prepare().unwrap();
        for batch in data.batches(16, 0).unwrap() {
            for label in batch.labels.to_vec1::<u32>().unwrap() {
                assert!(label < 4);
            }
        }
    }
}
