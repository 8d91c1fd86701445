//! Business worker pool subsystem.
//!
//! # Data Flow
//! ```text
//! ExecutorConfig (mode + explicit sizes)
//!     → resolve_sizing (cpu_bound / io_bound / mixed)
//!     → BizExecutor (pool.rs)
//!     → ExecutorHandle (hot-swappable, shared by dispatch and sampler)
//!
//! On reload with new sizing:
//!     new BizExecutor built → swapped in → old pool drained in the background
//! ```

pub mod pool;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::{ExecutorConfig, ThreadingMode, ValidationError};

pub use pool::{BizExecutor, PoolSizing, PoolStats, RejectedExecution};

use pool::Job;

/// Thread-name prefix of business workers.
pub const POOL_NAME: &str = "biz";

/// Turn the configured mode into concrete pool dimensions for `cores` CPUs.
pub fn resolve_sizing(config: &ExecutorConfig, cores: usize) -> Result<PoolSizing, ValidationError> {
    let (core, max) = match config.mode {
        ThreadingMode::CpuBound => (cores + 1, cores + 1),
        ThreadingMode::IoBound => (cores * 2 + 1, cores * 2 + 1),
        ThreadingMode::Mixed => {
            if config.core_size == 0 || config.max_size < config.core_size {
                return Err(ValidationError {
                    field: "executor".into(),
                    message: format!(
                        "mixed mode needs max_size >= core_size >= 1 (core={}, max={})",
                        config.core_size, config.max_size
                    ),
                });
            }
            (config.core_size, config.max_size)
        }
    };
    Ok(PoolSizing {
        core,
        max,
        queue_capacity: config.queue_capacity,
        keep_alive: Duration::from_secs(config.keep_alive_secs),
    })
}

/// Shared, resizable handle to the current business pool.
#[derive(Clone)]
pub struct ExecutorHandle {
    current: Arc<ArcSwap<BizExecutor>>,
}

impl ExecutorHandle {
    pub fn new(sizing: PoolSizing) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(BizExecutor::new(POOL_NAME, sizing))),
        }
    }

    /// The pool new work is submitted to.
    pub fn current(&self) -> Arc<BizExecutor> {
        self.current.load_full()
    }

    pub fn execute<F>(&self, task: F) -> Result<(), RejectedExecution>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_to(self.current.load_full(), Box::new(task))
    }

    /// Submit to `pool`. When a resize retired it after it was picked, the
    /// job goes to the replacement once.
    fn submit_to(&self, pool: Arc<BizExecutor>, job: Job) -> Result<(), RejectedExecution> {
        match pool.submit(job) {
            Ok(()) => Ok(()),
            Err((rejected, Some(job))) => {
                let current = self.current.load_full();
                if Arc::ptr_eq(&pool, &current) {
                    return Err(rejected);
                }
                tracing::debug!(pool = %rejected.pool, "Pool retired during submit, retrying on replacement");
                current.submit(job).map_err(|(rejected, _)| rejected)
            }
            Err((rejected, None)) => Err(rejected),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.current.load().stats()
    }

    /// Replace the pool when the sizing changed. The old pool stops taking
    /// work but finishes everything already queued or running on its own
    /// workers. Returns the retired pool, if any.
    pub fn resize(&self, sizing: PoolSizing) -> Option<Arc<BizExecutor>> {
        if self.current.load().sizing() == sizing {
            return None;
        }
        let old = self.current.swap(Arc::new(BizExecutor::new(POOL_NAME, sizing)));
        let old_stats = old.stats();
        tracing::info!(
            core = sizing.core,
            max = sizing.max,
            queue_capacity = sizing.queue_capacity,
            old_active = old_stats.active,
            old_queued = old_stats.queued,
            "Worker pool resized, draining previous pool"
        );
        old.shutdown();
        Some(old)
    }

    pub fn shutdown(&self) {
        self.current.load().shutdown();
    }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.current.load().await_termination(timeout)
    }
}
