//! Patch extraction and embedding.

use candle_core::Tensor;

use crate::error::{Result, ShardVitError};
use crate::norm::{apply_norm, norm_specs};
use crate::shard::{apply_linear, linear_specs, ParamSpec, ParamView, ShardableModule};

/// Split a batch of images [b, c, h, w] into flattened patches
/// [b, (h/p)(w/p), c*p*p], row-major over patch positions.
pub fn patchify(images: &Tensor, patch_size: usize) -> Result<Tensor> {
    let (b, c, h, w) = images.dims4().map_err(|_| {
        ShardVitError::shape("[batch, channels, height, width]", format!("{:?}", images.dims()))
    })?;
    if patch_size == 0 || h % patch_size != 0 || w % patch_size != 0 {
        return Err(ShardVitError::shape(
            format!("image dims divisible by patch_size {}", patch_size),
            format!("{}x{}", h, w),
        ));
    }
    let ph = h / patch_size;
    let pw = w / patch_size;

    // [b, c, ph, p, pw, p] -> [b, ph, pw, c, p, p] -> [b, ph*pw, c*p*p]
    let x = images.reshape((b, c, ph, patch_size, pw, patch_size))?;
    let x = x.permute((0, 2, 4, 1, 3, 5))?.contiguous()?;
    Ok(x.reshape((b, ph * pw, c * patch_size * patch_size))?)
}

/// Patch embedding: flatten patches, project to the model width, then a
/// learned post-projection layer norm.
pub struct PatchEmbed {
    patch_size: usize,
    patch_dim: usize,
    dim: usize,
    eps: f64,
}

impl PatchEmbed {
    pub fn new(patch_size: usize, in_channels: usize, dim: usize, eps: f64) -> Self {
        Self {
            patch_size,
            patch_dim: in_channels * patch_size * patch_size,
            dim,
            eps,
        }
    }
}

impl ShardableModule for PatchEmbed {
    fn param_specs(&self) -> Vec<ParamSpec> {
        let mut specs = linear_specs("proj", self.patch_dim, self.dim, true);
        specs.extend(norm_specs("norm", self.dim));
        specs
    }

    fn forward_with(&self, images: &Tensor, params: &ParamView, _train: bool) -> Result<Tensor> {
        let patches = patchify(images, self.patch_size)?;
        let embedded = apply_linear(&patches, &params.pp("proj"), true)?;
        apply_norm(&embedded, &params.pp("norm"), self.eps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedMemoryTracker;
    use crate::mesh::DeviceMesh;
    use crate::shard::ShardedBlock;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_patchify_position_count() {
        let device = Device::Cpu;
        for (h, w, p) in [(32, 32, 4), (32, 32, 8), (16, 32, 4), (8, 8, 8)] {
            let images = Tensor::zeros((2, 3, h, w), candle_core::DType::F32, &device).unwrap();
            let patches = patchify(&images, p).unwrap();
            assert_eq!(patches.dims(), &[2, (h / p) * (w / p), 3 * p * p]);
        }
    }

    #[test]
    fn test_patchify_cifar_geometry() {
        // 32x32 RGB with 4x4 patches: 64 positions of 48 values
        let device = Device::Cpu;
        let images = Tensor::zeros((1, 3, 32, 32), candle_core::DType::F32, &device).unwrap();
        let patches = patchify(&images, 4).unwrap();
        assert_eq!(patches.dims(), &[1, 64, 48]);
    }

    #[test]
    fn test_patchify_rejects_indivisible() {
        let device = Device::Cpu;
        let images = Tensor::zeros((1, 3, 30, 32), candle_core::DType::F32, &device).unwrap();
        assert!(patchify(&images, 4).is_err());
    }

    #[test]
    fn test_patchify_preserves_values() {
        let device = Device::Cpu;
        // 1x1x2x2 image with 1x1 patches keeps each pixel as its own patch,
        // row-major over positions
        let images = Tensor::new(&[[[[1f32, 2.0], [3.0, 4.0]]]], &device).unwrap();
        let patches = patchify(&images, 1).unwrap();
        assert_eq!(patches.dims(), &[1, 4, 1]);
        let flat = patches.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_patch_embed_output_shape() {
        let device = Device::Cpu;
        let mesh = DeviceMesh::single(device.clone());
        let tracker = SharedMemoryTracker::new();
        let embed = PatchEmbed::new(8, 3, 16, 1e-5);
        let mut rng = StdRng::seed_from_u64(0);
        let block = ShardedBlock::new("patch", embed, &mesh, &tracker, &mut rng).unwrap();

        let images = Tensor::randn(0.0f32, 1.0, (2, 3, 32, 32), &device).unwrap();
        let out = block.forward(&images, false).unwrap();
        assert_eq!(out.dims(), &[2, 16, 16]);
    }
}
