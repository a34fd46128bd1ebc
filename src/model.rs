//! The Vision Transformer, assembled from sharded blocks.
//!
//! Construction is two-phase, leaves first: every pre-normed attention and
//! feed-forward block gets its own flat parameter, then the remainder
//! (patch embedding, positional table, final norm, pooler, classifier head)
//! is gathered into one root flat parameter. The root is materialized for
//! the whole forward pass since its parameters are consumed at both ends of
//! the pipeline; each leaf block re-shards as soon as it returns.

use candle_core::{Tensor, Var};
use candle_nn::Dropout;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::attention::Attention;
use crate::config::VitConfig;
use crate::error::{Result, ShardVitError};
use crate::memory::SharedMemoryTracker;
use crate::mesh::DeviceMesh;
use crate::mlp::FeedForward;
use crate::norm::{apply_norm, norm_specs, scoped_specs, PreNorm};
use crate::patch::PatchEmbed;
use crate::pooler::AttnPooler;
use crate::shard::{
    apply_linear, linear_specs, FlatParam, ParamInit, ParamSpec, ShardableModule, ShardedBlock,
};

pub struct VisionTransformer {
    config: VitConfig,
    patch: PatchEmbed,
    pool: AttnPooler,
    attn_blocks: Vec<ShardedBlock<PreNorm<Attention>>>,
    ffn_blocks: Vec<ShardedBlock<PreNorm<FeedForward>>>,
    root: FlatParam,
    emb_dropout: Dropout,
}

impl VisionTransformer {
    /// Build the model with all parameters drawn from a seeded rng, so the
    /// same seed yields the same starting state on every worker and across
    /// runs.
    pub fn new(
        config: VitConfig,
        mesh: &DeviceMesh,
        tracker: &SharedMemoryTracker,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        let dim = config.dim();
        let eps = config.layer_norm_eps;
        let mut rng = StdRng::seed_from_u64(seed);

        // Phase one: each attention and FFN block sharded independently
        let mut attn_blocks = Vec::with_capacity(config.num_layers);
        let mut ffn_blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let attn = PreNorm::new(
                dim,
                eps,
                Attention::new(dim, config.num_heads, config.head_dim, config.dropout),
            );
            attn_blocks.push(ShardedBlock::new(
                format!("blocks.{}.attn", i),
                attn,
                mesh,
                tracker,
                &mut rng,
            )?);

            let ffn = PreNorm::new(
                dim,
                eps,
                FeedForward::new(dim, config.mlp_dim(), config.dropout),
            );
            ffn_blocks.push(ShardedBlock::new(
                format!("blocks.{}.ffn", i),
                ffn,
                mesh,
                tracker,
                &mut rng,
            )?);
        }

        // Phase two: everything not claimed by a block goes into the root
        let patch = PatchEmbed::new(config.patch_size, config.in_channels, dim, eps);
        let pool = AttnPooler::new(dim);

        let mut root_specs = scoped_specs("patch", patch.param_specs());
        root_specs.push(ParamSpec::new(
            "pos_emb",
            vec![config.num_patches(), dim],
            ParamInit::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        ));
        root_specs.extend(norm_specs("norm", dim));
        root_specs.extend(scoped_specs("pool", pool.param_specs()));
        root_specs.extend(linear_specs("head", dim, config.num_classes, true));
        let root = FlatParam::new("root", root_specs, mesh, tracker, &mut rng)?;

        Ok(Self {
            emb_dropout: Dropout::new(config.emb_dropout),
            config,
            patch,
            pool,
            attn_blocks,
            ffn_blocks,
            root,
        })
    }

    pub fn config(&self) -> &VitConfig {
        &self.config
    }

    /// Classify a batch of images. Returns logits [b, num_classes].
    pub fn forward(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let (_, c, h, w) = images.dims4().map_err(|_| {
            ShardVitError::shape(
                "[batch, channels, height, width]",
                format!("{:?}", images.dims()),
            )
        })?;
        if c != self.config.in_channels || h != self.config.image_size || w != self.config.image_size
        {
            return Err(ShardVitError::shape(
                format!(
                    "[_, {}, {}, {}]",
                    self.config.in_channels, self.config.image_size, self.config.image_size
                ),
                format!("[_, {}, {}, {}]", c, h, w),
            ));
        }

        let root = self.root.materialize()?;
        let view = root.view();

        let mut x = self.patch.forward_with(images, &view.pp("patch"), train)?;

        let pos = view.get("pos_emb")?;
        let n = x.dim(1)?;
        if n != pos.dim(0)? {
            return Err(ShardVitError::shape(
                format!("{} patch positions", pos.dim(0)?),
                format!("{}", n),
            ));
        }
        x = x.broadcast_add(&pos)?;
        x = self.emb_dropout.forward(&x, train)?;

        for (attn, ffn) in self.attn_blocks.iter().zip(self.ffn_blocks.iter()) {
            x = (&x + attn.forward(&x, train)?)?;
            x = (&x + ffn.forward(&x, train)?)?;
        }

        x = apply_norm(&x, &view.pp("norm"), self.config.layer_norm_eps)?;
        let pooled = self.pool.forward_with(&x, &view.pp("pool"), train)?;
        let logits = apply_linear(&pooled, &view.pp("head"), true)?;

        drop(root);
        Ok(logits)
    }

    /// Every shard variable in the model with its scoped name, name-sorted.
    /// This is the set the optimizer updates and the order gradients are
    /// reduced in.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = self.root.named_vars();
        for block in &self.attn_blocks {
            vars.extend(block.named_vars());
        }
        for block in &self.ffn_blocks {
            vars.extend(block.named_vars());
        }
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// Trainable element count (excluding shard padding)
    pub fn num_parameters(&self) -> usize {
        let leaves: usize = self
            .attn_blocks
            .iter()
            .map(|b| b.flat().numel())
            .chain(self.ffn_blocks.iter().map(|b| b.flat().numel()))
            .sum();
        leaves + self.root.numel()
    }

    /// Bytes resident in shards between steps, per worker
    pub fn resident_shard_bytes(&self) -> usize {
        self.attn_blocks
            .iter()
            .map(|b| b.flat().shard_bytes())
            .chain(self.ffn_blocks.iter().map(|b| b.flat().shard_bytes()))
            .sum::<usize>()
            + self.root.shard_bytes()
    }

    /// Upper bound on tracked parameter memory during a forward pass: the
    /// sharded residue plus the gathered root plus the largest single
    /// gathered leaf block.
    pub fn peak_materialized_bound(&self) -> usize {
        let root_overhead = self.root.full_bytes() - self.root.shard_bytes();
        let max_leaf_overhead = self
            .attn_blocks
            .iter()
            .map(|b| b.flat().full_bytes() - b.flat().shard_bytes())
            .chain(
                self.ffn_blocks
                    .iter()
                    .map(|b| b.flat().full_bytes() - b.flat().shard_bytes()),
            )
            .max()
            .unwrap_or(0);
        self.resident_shard_bytes() + root_overhead + max_leaf_overhead
    }
}
