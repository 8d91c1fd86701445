//! Periodic occupancy and throughput sampling.
//!
//! Every tick the sampler drains the hit/sent counters, reads the worker
//! pool's occupancy and hands a [`StatusSample`] to the registered
//! [`StatusListener`]. Quiet ticks (no traffic, pool unchanged) are skipped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::executor::{ExecutorHandle, PoolStats};
use crate::observability::counters::Counters;

/// One sampling period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSample {
    pub period_ms: u64,
    pub hits: u64,
    pub sent: u64,
    /// Requests per second over the period.
    pub hit_rate: f64,
    /// Responses per second over the period.
    pub send_rate: f64,
    pub active_channels: u64,
    pub pool: PoolStats,
}

/// Receives samples. Called from the sampler task; must not block.
pub trait StatusListener: Send + Sync + 'static {
    fn on_sample(&self, sample: &StatusSample);
}

/// Logs samples and mirrors them into metrics gauges.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStatusListener;

impl StatusListener for LoggingStatusListener {
    fn on_sample(&self, s: &StatusSample) {
        tracing::info!(
            hit_rate = s.hit_rate,
            send_rate = s.send_rate,
            active_channels = s.active_channels,
            pool_size = s.pool.pool_size,
            active = s.pool.active,
            queued = s.pool.queued,
            core = s.pool.core,
            max = s.pool.max,
            largest = s.pool.largest,
            tasks = s.pool.task_count,
            completed = s.pool.completed,
            "Status"
        );
        crate::observability::metrics::record_sample(s);
    }
}

/// Drains counters into samples.
pub struct Sampler {
    counters: Arc<Counters>,
    executor: ExecutorHandle,
    listener: Arc<dyn StatusListener>,
    last_pool: Option<PoolStats>,
}

impl Sampler {
    pub fn new(counters: Arc<Counters>, executor: ExecutorHandle, listener: Arc<dyn StatusListener>) -> Self {
        Self {
            counters,
            executor,
            listener,
            last_pool: None,
        }
    }

    /// Take one sample covering `period`. Returns it only if activity changed
    /// since the last reported sample; the listener is notified in that case.
    pub fn tick(&mut self, period: Duration) -> Option<StatusSample> {
        let hits = self.counters.take_hits();
        let sent = self.counters.take_sent();
        let pool = self.executor.stats();

        let pool_changed = self.last_pool.map_or(true, |last| {
            (last.pool_size, last.active, last.queued, last.completed)
                != (pool.pool_size, pool.active, pool.queued, pool.completed)
        });
        if hits == 0 && sent == 0 && !pool_changed {
            return None;
        }
        self.last_pool = Some(pool);

        let secs = period.as_secs_f64().max(f64::EPSILON);
        let sample = StatusSample {
            period_ms: period.as_millis() as u64,
            hits,
            sent,
            hit_rate: hits as f64 / secs,
            send_rate: sent as f64 / secs,
            active_channels: self.counters.active_channels(),
            pool,
        };
        self.listener.on_sample(&sample);
        Some(sample)
    }

    /// Tick every `period` until `shutdown` fires.
    pub async fn run(mut self, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        interval.tick().await;
        let mut last = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                now = interval.tick() => {
                    self.tick(now.saturating_duration_since(last));
                    last = now;
                }
            }
        }
        tracing::debug!("Sampler stopped");
    }
}
