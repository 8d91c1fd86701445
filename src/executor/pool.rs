//! Bounded, resizable thread pool for business logic.
//!
//! # Responsibilities
//! - Run blocking business tasks off the I/O runtime
//! - Bound concurrency (core/max workers) and queueing (queue capacity)
//! - Reject work explicitly when both are saturated
//! - Retire idle non-core workers after the keep-alive
//!
//! # Submission order
//! ```text
//! workers < core                 → start a worker with the task
//! idle worker or queue has room  → enqueue
//! workers < max                  → start a worker with the task
//! otherwise                      → RejectedExecution
//! ```
//!
//! # Design Decisions
//! - OS threads, not async tasks: business callbacks may block
//! - Shutdown is a drain: queued tasks still run, nothing is cancelled

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Resolved pool dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    pub core: usize,
    pub max: usize,
    pub queue_capacity: usize,
    pub keep_alive: Duration,
}

/// Point-in-time occupancy of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub active: usize,
    pub queued: usize,
    pub core: usize,
    pub max: usize,
    pub largest: usize,
    pub task_count: u64,
    pub completed: u64,
}

/// The pool refused a task.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "task rejected by pool '{pool}' (pool_size={}, queued={}, active={}, core={}, max={}, largest={}, tasks={}, completed={}, shutdown={shutdown})",
    .stats.pool_size, .stats.queued, .stats.active, .stats.core, .stats.max, .stats.largest,
    .stats.task_count, .stats.completed
)]
pub struct RejectedExecution {
    pub pool: String,
    pub stats: PoolStats,
    pub shutdown: bool,
}

struct PoolState {
    queue: VecDeque<Job>,
    workers: usize,
    idle: usize,
    active: usize,
    largest: usize,
    submitted: u64,
    completed: u64,
    next_worker_id: u64,
    shutdown: bool,
}

struct Inner {
    name: String,
    sizing: PoolSizing,
    state: Mutex<PoolState>,
    available: Condvar,
    terminated: Condvar,
}

/// A bounded worker pool.
#[derive(Clone)]
pub struct BizExecutor {
    inner: Arc<Inner>,
}

impl BizExecutor {
    pub fn new(name: impl Into<String>, sizing: PoolSizing) -> Self {
        let name = name.into();
        tracing::info!(
            pool = %name,
            core = sizing.core,
            max = sizing.max,
            queue_capacity = sizing.queue_capacity,
            keep_alive_secs = sizing.keep_alive.as_secs(),
            "Worker pool created"
        );
        Self {
            inner: Arc::new(Inner {
                name,
                sizing,
                state: Mutex::new(PoolState {
                    queue: VecDeque::with_capacity(sizing.queue_capacity.min(1024)),
                    workers: 0,
                    idle: 0,
                    active: 0,
                    largest: 0,
                    submitted: 0,
                    completed: 0,
                    next_worker_id: 0,
                    shutdown: false,
                }),
                available: Condvar::new(),
                terminated: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn sizing(&self) -> PoolSizing {
        self.inner.sizing
    }

    /// Submit a task.
    pub fn execute<F>(&self, task: F) -> Result<(), RejectedExecution>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(task)).map_err(|(rejected, _)| rejected)
    }

    /// Like `execute`, but a job refused because the pool is shut down is
    /// handed back so it can be offered elsewhere.
    pub(crate) fn submit(&self, job: Job) -> Result<(), (RejectedExecution, Option<Job>)> {
        let sizing = self.inner.sizing;
        let mut state = self.inner.state.lock();

        if state.shutdown {
            return Err((self.reject(&state), Some(job)));
        }

        if state.workers < sizing.core {
            return self.spawn_worker(&mut state, job).map_err(|rejected| (rejected, None));
        }

        let waiting_idle = state.idle > state.queue.len();
        if waiting_idle || state.queue.len() < sizing.queue_capacity {
            state.queue.push_back(job);
            state.submitted += 1;
            self.inner.available.notify_one();
            return Ok(());
        }

        if state.workers < sizing.max {
            return self.spawn_worker(&mut state, job).map_err(|rejected| (rejected, None));
        }

        Err((self.reject(&state), None))
    }

    fn spawn_worker(&self, state: &mut PoolState, first: Job) -> Result<(), RejectedExecution> {
        let id = state.next_worker_id;
        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.inner.name, id))
            .spawn(move || worker_loop(inner, first));

        match spawned {
            Ok(_) => {
                state.next_worker_id += 1;
                state.workers += 1;
                state.submitted += 1;
                state.largest = state.largest.max(state.workers);
                Ok(())
            }
            Err(e) => {
                tracing::error!(pool = %self.inner.name, error = %e, "Failed to start worker thread");
                Err(self.reject(state))
            }
        }
    }

    fn reject(&self, state: &PoolState) -> RejectedExecution {
        let stats = snapshot(&self.inner.sizing, state);
        tracing::warn!(
            pool = %self.inner.name,
            pool_size = stats.pool_size,
            queued = stats.queued,
            active = stats.active,
            core = stats.core,
            max = stats.max,
            largest = stats.largest,
            tasks = stats.task_count,
            completed = stats.completed,
            shutdown = state.shutdown,
            "Worker pool saturated, task rejected"
        );
        RejectedExecution {
            pool: self.inner.name.clone(),
            stats,
            shutdown: state.shutdown,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        snapshot(&self.inner.sizing, &state)
    }

    /// Stop accepting tasks. Queued and running tasks still complete.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        tracing::info!(
            pool = %self.inner.name,
            queued = state.queue.len(),
            active = state.active,
            "Worker pool shutting down"
        );
        self.inner.available.notify_all();
        if state.workers == 0 {
            self.inner.terminated.notify_all();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// True once shut down and every worker has exited.
    pub fn is_terminated(&self) -> bool {
        let state = self.inner.state.lock();
        state.shutdown && state.workers == 0
    }

    /// Block until every worker exited after shutdown, or the timeout elapses.
    /// Returns whether the pool terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while !(state.shutdown && state.workers == 0) {
            if self.inner.terminated.wait_until(&mut state, deadline).timed_out() {
                return state.shutdown && state.workers == 0;
            }
        }
        true
    }
}

impl std::fmt::Debug for BizExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BizExecutor")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

fn snapshot(sizing: &PoolSizing, state: &PoolState) -> PoolStats {
    PoolStats {
        pool_size: state.workers,
        active: state.active,
        queued: state.queue.len(),
        core: sizing.core,
        max: sizing.max,
        largest: state.largest,
        task_count: state.submitted,
        completed: state.completed,
    }
}

fn worker_loop(inner: Arc<Inner>, first: Job) {
    let mut next = Some(first);
    loop {
        let job = match next.take() {
            Some(job) => job,
            None => match next_job(&inner) {
                Some(job) => job,
                None => return,
            },
        };

        inner.state.lock().active += 1;
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(pool = %inner.name, "Task panicked on worker thread");
        }
        let mut state = inner.state.lock();
        state.active -= 1;
        state.completed += 1;
    }
}

/// Wait for the next job. Returns `None` when the worker must exit, in which
/// case it has already been removed from the worker count.
fn next_job(inner: &Inner) -> Option<Job> {
    let mut state = inner.state.lock();
    loop {
        if let Some(job) = state.queue.pop_front() {
            return Some(job);
        }
        if state.shutdown {
            return retire(inner, &mut state);
        }

        state.idle += 1;
        let timed_out = if state.workers > inner.sizing.core {
            inner
                .available
                .wait_for(&mut state, inner.sizing.keep_alive)
                .timed_out()
        } else {
            inner.available.wait(&mut state);
            false
        };
        state.idle -= 1;

        if timed_out && state.queue.is_empty() && state.workers > inner.sizing.core {
            return retire(inner, &mut state);
        }
    }
}

fn retire(inner: &Inner, state: &mut PoolState) -> Option<Job> {
    state.workers -= 1;
    if state.workers == 0 && state.shutdown {
        inner.terminated.notify_all();
    }
    None
}
