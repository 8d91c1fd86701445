//! Metrics exposition.
//!
//! # Metrics
//! - `engine_hit_rate` (gauge): decoded requests per second
//! - `engine_send_rate` (gauge): responses per second
//! - `engine_active_channels` (gauge): open connections
//! - `engine_pool_{size,active,queued,largest}` (gauge): worker pool occupancy
//! - `engine_pool_completed_total` (gauge): tasks completed by the current pool
//!
//! Gauges are fed by the status sampler; with no recorder installed the
//! macros are no-ops.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::observability::sampler::StatusSample;

/// Start the Prometheus scrape endpoint. Must run inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_sample(s: &StatusSample) {
    metrics::gauge!("engine_hit_rate").set(s.hit_rate);
    metrics::gauge!("engine_send_rate").set(s.send_rate);
    metrics::gauge!("engine_active_channels").set(s.active_channels as f64);
    metrics::gauge!("engine_pool_size").set(s.pool.pool_size as f64);
    metrics::gauge!("engine_pool_active").set(s.pool.active as f64);
    metrics::gauge!("engine_pool_queued").set(s.pool.queued as f64);
    metrics::gauge!("engine_pool_largest").set(s.pool.largest as f64);
    metrics::gauge!("engine_pool_completed_total").set(s.pool.completed as f64);
}

pub fn record_rejection() {
    metrics::counter!("engine_pool_rejected_total").increment(1);
}
