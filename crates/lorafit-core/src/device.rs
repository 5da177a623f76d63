use candle_core::{DType, Device};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

/// Selects the compute device for this process.
///
/// With the `cuda` feature and `prefer_gpu`, tries CUDA device
/// `device_index`.  Falls back to CPU on any error.
pub fn select_device(prefer_gpu: bool, #[allow(unused_variables)] device_index: usize) -> CoreResult<Device> {
    #[cfg(feature = "cuda")]
    if prefer_gpu {
        match Device::new_cuda(device_index) {
            Ok(dev) => {
                info!(device_index, "Using CUDA device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "CUDA unavailable, falling back to CPU");
            }
        }
    }

    #[cfg(feature = "metal")]
    if prefer_gpu {
        match Device::new_metal(0) {
            Ok(dev) => {
                info!("Using Metal device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "Metal unavailable, falling back to CPU");
            }
        }
    }

    info!("Using CPU device");
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    if prefer_gpu {
        warn!(
            "--gpu has no effect: binary was not compiled with GPU support. \
             Rebuild with `--features cuda` (requires the CUDA toolkit)."
        );
    }
    Ok(Device::Cpu)
}

/// Human-readable device kind.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// Weight dtype for training on `device`: BF16 on CUDA, F32 elsewhere.
pub fn training_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::BF16
    } else {
        DType::F32
    }
}

// ── Process placement ─────────────────────────────────────────────────────────

/// Where this process sits in a multi-process launch.
///
/// Built once at startup; nothing below the CLI reads `WORLD_SIZE` or
/// `LOCAL_RANK` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedContext {
    world_size: usize,
    local_rank: usize,
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self { world_size: 1, local_rank: 0 }
    }
}

impl DistributedContext {
    pub fn new(world_size: usize, local_rank: usize) -> CoreResult<Self> {
        if world_size == 0 {
            return Err(CoreError::config("world_size", "must be at least 1"));
        }
        if local_rank >= world_size {
            return Err(CoreError::config(
                "local_rank",
                format!("{local_rank} is out of range for world size {world_size}"),
            ));
        }
        Ok(Self { world_size, local_rank })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// More than one process takes part in training.
    pub fn is_distributed(&self) -> bool {
        self.world_size != 1
    }

    /// Device ordinal for this process: 0 alone, `local_rank` otherwise.
    pub fn device_index(&self) -> usize {
        if self.is_distributed() {
            self.local_rank
        } else {
            0
        }
    }

    /// Rank 0 logs summaries and writes outputs.
    pub fn is_main_process(&self) -> bool {
        self.local_rank == 0
    }

    /// Micro-batches per optimizer step.
    ///
    /// `batch_size / micro_batch_size`, divided again by the world size when
    /// distributed.  Integer division throughout; a zero result is raised to 1.
    pub fn gradient_accumulation_steps(&self, batch_size: usize, micro_batch_size: usize) -> usize {
        let mut steps = batch_size / micro_batch_size.max(1);
        if self.is_distributed() {
            steps /= self.world_size;
        }
        if steps == 0 {
            warn!(
                batch_size,
                micro_batch_size,
                world_size = self.world_size,
                "Gradient accumulation steps rounded down to 0, using 1"
            );
            steps = 1;
        }
        steps
    }

    /// Whether the item at `index` belongs to this rank.
    pub fn owns(&self, index: usize) -> bool {
        index % self.world_size == self.local_rank
    }
}
