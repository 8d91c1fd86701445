//! Engine health and pause state.
//!
//! # States
//! - Health check failed: set by the health inspector (or an admin endpoint)
//! - Paused: set administratively to drain traffic away from this instance
//!
//! The two flags are independent. Reasons are kept alongside so the ping
//! handler and its hooks can report why the instance is unavailable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Shared health/pause flags with reasons.
#[derive(Debug, Default)]
pub struct HealthState {
    health_check_failed: AtomicBool,
    health_reason: ArcSwapOption<String>,
    paused: AtomicBool,
    pause_reason: ArcSwapOption<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a health inspection.
    pub fn set_health_check_failed(&self, failed: bool, reason: Option<String>) {
        let was = self.health_check_failed.swap(failed, Ordering::SeqCst);
        self.health_reason.store(reason.map(Arc::new));
        if was != failed {
            if failed {
                tracing::warn!(reason = ?self.health_reason(), "Health check failed");
            } else {
                tracing::info!("Health check recovered");
            }
        }
    }

    /// Pause or resume the instance.
    pub fn set_paused(&self, paused: bool, reason: Option<String>) {
        let was = self.paused.swap(paused, Ordering::SeqCst);
        self.pause_reason.store(reason.map(Arc::new));
        if was != paused {
            tracing::info!(paused, reason = ?self.pause_reason(), "Pause state changed");
        }
    }

    pub fn is_health_check_failed(&self) -> bool {
        self.health_check_failed.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn health_reason(&self) -> Option<String> {
        self.health_reason.load_full().map(|r| r.as_ref().clone())
    }

    pub fn pause_reason(&self) -> Option<String> {
        self.pause_reason.load_full().map(|r| r.as_ref().clone())
    }

    /// True when neither flag is raised.
    pub fn is_serving(&self) -> bool {
        !self.is_health_check_failed() && !self.is_paused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent() {
        let state = HealthState::new();
        assert!(state.is_serving());

        state.set_paused(true, Some("maintenance".into()));
        assert!(state.is_paused());
        assert!(!state.is_health_check_failed());
        assert_eq!(state.pause_reason().as_deref(), Some("maintenance"));

        state.set_health_check_failed(true, Some("db down".into()));
        state.set_paused(false, None);
        assert!(!state.is_serving());
        assert_eq!(state.pause_reason(), None);
        assert_eq!(state.health_reason().as_deref(), Some("db down"));
    }
}
