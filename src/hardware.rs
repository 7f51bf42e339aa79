use crate::error::{MsaError, Result};
use log::info;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

/// Upper bound of the derived thread count for the final model evaluation.
const MAX_REFERENCE_THREADS: usize = 8;

/// Thread count for the parallel stages: all cores when `configured <= 0`.
pub fn resolve_num_threads(configured: i32) -> usize {
    let num_cores = num_cpus::get();
    info!("Detected {} CPU cores", num_cores);

    if configured <= 0 {
        info!("Automatically set {} threads.", num_cores);
        num_cores
    } else {
        info!("Statically set {} threads.", configured);
        configured as usize
    }
}

/// Thread count for the scoring model used by construction and refinement.
///
/// An explicit value wins; otherwise half the main threads, kept in `1..=8`.
pub fn resolve_reference_threads(configured: i32, main_threads: usize) -> usize {
    if configured > 0 {
        configured as usize
    } else {
        (main_threads / 2).clamp(1, MAX_REFERENCE_THREADS)
    }
}

/// Offload context for the posterior and consistency kernels.
///
/// Kernels submitted to the context run on its own worker pool, batch by batch,
/// and block the caller until the batch completes.
#[derive(Clone)]
pub struct AcceleratorContext {
    name: String,
    pool: Arc<ThreadPool>,
    batch_size: usize,
    fast_math: bool,
}

impl AcceleratorContext {
    pub fn new(name: &str, num_workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("accel-{}", i))
            .build()
            .map_err(|e| MsaError::stage("accelerator", e.to_string()))?;

        Ok(AcceleratorContext {
            name: name.to_string(),
            pool: Arc::new(pool),
            batch_size: 256,
            fast_math: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Number of sequence pairs submitted per kernel launch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn fast_math(&self) -> bool {
        self.fast_math
    }

    pub fn set_fast_math(&mut self, enabled: bool) {
        self.fast_math = enabled;
    }

    /// Run `op` on the device pool and wait for it.
    pub fn launch<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }
}

impl std::fmt::Debug for AcceleratorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratorContext")
            .field("name", &self.name)
            .field("workers", &self.num_workers())
            .field("batch_size", &self.batch_size)
            .field("fast_math", &self.fast_math)
            .finish()
    }
}
