//! Worker-group context and collective operations.
//!
//! A `DeviceMesh` carries the process-wide facts every sharded component
//! needs: this worker's rank, the group size, and the compute device. It is
//! created once at startup and passed explicitly to everything that issues
//! collectives, so no component touches global state.
//!
//! The provided backend is a single-process group: all shards live in local
//! memory, `all_gather` is an ordered concatenation, gradient averaging has
//! exactly one contribution per logical group, and `barrier` returns
//! immediately. A multi-process backend would implement the same surface
//! over real collectives.
//!
//! # Collective ordering
//!
//! Every worker must issue the same sequence of collectives in the same
//! order. A mismatched sequence does not produce an error value on a real
//! backend; it hangs the whole group. Callers keep ordering deterministic
//! (the trainer sorts shard names before reducing) rather than relying on
//! any runtime detection.

use candle_core::{Device, Tensor};
use tracing::info;

use crate::error::{Result, ShardVitError};

/// Process-group context: rank, world size, and compute device.
#[derive(Debug, Clone)]
pub struct DeviceMesh {
    rank: usize,
    world_size: usize,
    device: Device,
}

impl DeviceMesh {
    /// Initialize the group context for this worker.
    ///
    /// Fatal on invalid arguments. There is no retry path: a worker that
    /// cannot join the group cannot participate in any collective.
    pub fn init(world_size: usize, rank: usize, device: Device) -> Result<Self> {
        if world_size == 0 {
            return Err(ShardVitError::bootstrap("world_size must be at least 1"));
        }
        if rank >= world_size {
            return Err(ShardVitError::bootstrap(format!(
                "rank {} out of range for world_size {}",
                rank, world_size
            )));
        }
        info!(rank, world_size, "process group initialized");
        Ok(Self {
            rank,
            world_size,
            device,
        })
    }

    /// Single-worker context for unit tests and local runs.
    pub fn single(device: Device) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            device,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether this worker coordinates logging, progress, and data
    /// preparation.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Smallest multiple of `world_size` that holds `len` elements.
    pub fn padded_len(&self, len: usize) -> usize {
        len.div_ceil(self.world_size) * self.world_size
    }

    /// Gather per-rank shards into the full flat buffer, rank order
    /// preserved. The result stays connected to the autograd graph of every
    /// shard.
    pub fn all_gather(&self, shards: &[Tensor]) -> Result<Tensor> {
        if shards.len() != self.world_size {
            return Err(ShardVitError::training(format!(
                "all_gather expects {} shards, got {}",
                self.world_size,
                shards.len()
            )));
        }
        if self.world_size == 1 {
            return Ok(shards[0].clone());
        }
        Ok(Tensor::cat(shards, 0)?)
    }

    /// Slice rank `rank`'s shard out of a flat buffer whose length is a
    /// multiple of `world_size`.
    pub fn shard_of(&self, flat: &Tensor, rank: usize) -> Result<Tensor> {
        let len = flat.dim(0)?;
        if len % self.world_size != 0 {
            return Err(ShardVitError::training(format!(
                "flat buffer of {} elements does not divide across {} workers",
                len, self.world_size
            )));
        }
        if rank >= self.world_size {
            return Err(ShardVitError::training(format!(
                "shard_of rank {} out of range for world_size {}",
                rank, self.world_size
            )));
        }
        let shard_len = len / self.world_size;
        Ok(flat.narrow(0, rank * shard_len, shard_len)?)
    }

    /// Average a gradient across the group.
    ///
    /// In the local backend each logical group contributes exactly one
    /// gradient, so the average is the input itself. The call is still
    /// routed through here so the collective sequence is explicit and
    /// identically ordered on every worker.
    pub fn all_reduce_avg(&self, grad: &Tensor) -> Result<Tensor> {
        Ok(grad.clone())
    }

    /// Replicate a coordinator-owned tensor to every worker.
    ///
    /// Unused by the local backend's training path: workers share one
    /// address space, so coordinator artifacts (the prepared dataset, the
    /// seeded initial parameters) are already visible everywhere and
    /// replication degenerates to a clone. A multi-process backend sends
    /// rank 0's buffer here instead, and callers that must stay portable
    /// route through this method rather than reading coordinator state
    /// directly.
    pub fn broadcast(&self, src: &Tensor) -> Result<Tensor> {
        Ok(src.clone())
    }

    /// Block until every worker reaches this point. Immediate in the local
    /// backend.
    pub fn barrier(&self) {}
}
