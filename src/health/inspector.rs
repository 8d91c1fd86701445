//! Periodic health inspection.
//!
//! The application supplies a [`HealthInspector`] that checks its own
//! dependencies (database, directory, downstream services). The monitor
//! runs it on a blocking thread at the configured interval and feeds the
//! outcome into [`HealthState`], which the ping handler reads.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::health::state::HealthState;
use crate::service::AppError;

/// Application health probe. An empty list means healthy.
pub trait HealthInspector: Send + Sync + 'static {
    fn ping(&self) -> Vec<AppError>;
}

impl<F> HealthInspector for F
where
    F: Fn() -> Vec<AppError> + Send + Sync + 'static,
{
    fn ping(&self) -> Vec<AppError> {
        self()
    }
}

/// Runs a [`HealthInspector`] on a timer.
pub struct HealthMonitor {
    inspector: Arc<dyn HealthInspector>,
    state: Arc<HealthState>,
}

impl HealthMonitor {
    pub fn new(inspector: Arc<dyn HealthInspector>, state: Arc<HealthState>) -> Self {
        Self { inspector, state }
    }

    /// Run one inspection and record the result.
    pub async fn inspect(&self) {
        let inspector = Arc::clone(&self.inspector);
        let errors = match tokio::task::spawn_blocking(move || inspector.ping()).await {
            Ok(errors) => errors,
            Err(e) => vec![AppError::new(
                crate::service::codes::UNEXPECTED,
                format!("health inspector panicked: {e}"),
            )],
        };
        if errors.is_empty() {
            self.state.set_health_check_failed(false, None);
        } else {
            let reason = errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            self.state.set_health_check_failed(true, Some(reason));
        }
    }

    /// Inspect immediately, then every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.inspect().await,
            }
        }
        tracing::debug!("Health monitor stopped");
    }
}
