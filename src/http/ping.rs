//! Liveness probe handling.
//!
//! Ping requests are answered on the I/O task and never reach the worker
//! pool, so probes keep working while the pool is saturated.
//!
//! # Status
//! - 200: healthy and not paused
//! - 502: the last health inspection failed
//! - 503: administratively paused (wins over a failed health check)

use std::sync::Arc;

use http::{header, Method, Response, StatusCode};

use crate::config::PingConfig;
use crate::health::HealthState;
use crate::http::response::{full, ResponseBody};
use crate::observability::Counters;

/// Result of evaluating the probe. The reason is always available to hooks,
/// whether or not it is exposed in the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingOutcome {
    pub path: String,
    pub status: StatusCode,
    pub reason: Option<String>,
}

/// Hooks around ping responses.
pub trait PingLifecycle: Send + Sync + 'static {
    /// Returning `false` suppresses the response; the connection is closed.
    fn before_ping(&self, _outcome: &PingOutcome) -> bool {
        true
    }

    fn after_ping(&self, _outcome: &PingOutcome) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPingLifecycle;

impl PingLifecycle for NoopPingLifecycle {}

/// Answers GET requests on the configured paths.
#[derive(Clone)]
pub struct PingHandler {
    config: Arc<PingConfig>,
    health: Arc<HealthState>,
    counters: Arc<Counters>,
    lifecycle: Arc<dyn PingLifecycle>,
}

impl PingHandler {
    pub fn new(
        config: Arc<PingConfig>,
        health: Arc<HealthState>,
        counters: Arc<Counters>,
        lifecycle: Arc<dyn PingLifecycle>,
    ) -> Self {
        Self {
            config,
            health,
            counters,
            lifecycle,
        }
    }

    /// Exact path match, GET only.
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        method == Method::GET && self.config.paths.iter().any(|p| p == path)
    }

    /// Compute status and reason from the health and pause flags.
    pub fn evaluate(&self, path: &str) -> PingOutcome {
        let mut status = StatusCode::OK;
        let mut reason = None;
        if self.health.is_health_check_failed() {
            status = StatusCode::BAD_GATEWAY;
            reason = Some(
                self.health
                    .health_reason()
                    .unwrap_or_else(|| "health check failed".to_string()),
            );
        }
        if self.health.is_paused() {
            status = StatusCode::SERVICE_UNAVAILABLE;
            reason = Some(self.health.pause_reason().unwrap_or_else(|| "paused".to_string()));
        }
        PingOutcome {
            path: path.to_string(),
            status,
            reason,
        }
    }

    /// Build the probe response, or `None` when a hook vetoed it.
    pub fn respond(&self, path: &str) -> Option<Response<ResponseBody>> {
        self.counters.ping_hit();
        let outcome = self.evaluate(path);
        if !self.lifecycle.before_ping(&outcome) {
            tracing::debug!(path, status = outcome.status.as_u16(), "Ping response vetoed");
            return None;
        }

        let body = match (&outcome.reason, self.config.expose_root_cause) {
            (Some(reason), true) => reason.clone(),
            _ => outcome.status.canonical_reason().unwrap_or("").to_string(),
        };
        let response = Response::builder()
            .status(outcome.status)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-store")
            .body(full(body));

        self.lifecycle.after_ping(&outcome);
        match response {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::error!(path, error = %e, "Failed to build ping response");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;

    fn handler(expose: bool, lifecycle: Arc<dyn PingLifecycle>) -> (PingHandler, Arc<HealthState>, Arc<Counters>) {
        let health = Arc::new(HealthState::new());
        let counters = Arc::new(Counters::new());
        let config = Arc::new(PingConfig {
            paths: vec!["/ping".into(), "/healthz".into()],
            expose_root_cause: expose,
        });
        (
            PingHandler::new(config, health.clone(), counters.clone(), lifecycle),
            health,
            counters,
        )
    }

    #[test]
    fn precedence_pause_over_health() {
        let (ping, health, _) = handler(false, Arc::new(NoopPingLifecycle));
        assert_eq!(ping.evaluate("/ping").status, StatusCode::OK);

        health.set_health_check_failed(true, Some("db".into()));
        assert_eq!(ping.evaluate("/ping").status, StatusCode::BAD_GATEWAY);

        health.set_paused(true, Some("deploy".into()));
        let outcome = ping.evaluate("/ping");
        assert_eq!(outcome.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(outcome.reason.as_deref(), Some("deploy"));

        health.set_health_check_failed(false, None);
        assert_eq!(ping.evaluate("/ping").status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn matches_exact_get_paths() {
        let (ping, _, _) = handler(false, Arc::new(NoopPingLifecycle));
        assert!(ping.matches(&Method::GET, "/healthz"));
        assert!(!ping.matches(&Method::POST, "/ping"));
        assert!(!ping.matches(&Method::GET, "/ping/"));
    }

    #[tokio::test]
    async fn reason_hidden_unless_exposed() {
        let (ping, health, counters) = handler(false, Arc::new(NoopPingLifecycle));
        health.set_health_check_failed(true, Some("db down".into()));
        let body = ping.respond("/ping").unwrap().into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Bad Gateway");
        assert_eq!(counters.ping_hits(), 1);

        let (ping, health, _) = handler(true, Arc::new(NoopPingLifecycle));
        health.set_health_check_failed(true, Some("db down".into()));
        let body = ping.respond("/ping").unwrap().into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"db down");
    }

    #[derive(Default)]
    struct VetoPaused(Mutex<Vec<PingOutcome>>);

    impl PingLifecycle for VetoPaused {
        fn before_ping(&self, outcome: &PingOutcome) -> bool {
            self.0.lock().push(outcome.clone());
            outcome.status != StatusCode::SERVICE_UNAVAILABLE
        }
    }

    #[test]
    fn hooks_see_reason_and_may_veto() {
        let hooks = Arc::new(VetoPaused::default());
        let (ping, health, _) = handler(false, hooks.clone());
        health.set_paused(true, Some("drain".into()));
        assert!(ping.respond("/ping").is_none());
        assert_eq!(hooks.0.lock()[0].reason.as_deref(), Some("drain"));
    }
}
