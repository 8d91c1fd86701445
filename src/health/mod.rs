//! Health and pause state subsystem.
//!
//! # Data Flow
//! ```text
//! Periodic inspection (inspector.rs):
//!     Timer → HealthInspector::ping (blocking thread)
//!     → state.rs (health-check failed + reason)
//!
//! Administrative pause:
//!     Operator endpoint / ServerHandle → state.rs (paused + reason)
//!
//! Readers:
//!     Ping handler, readiness endpoints
//! ```
//!
//! # Design Decisions
//! - The two flags are independent; precedence is decided by the reader
//! - State is shared by handle, never through a global

pub mod inspector;
pub mod state;

pub use inspector::{HealthInspector, HealthMonitor};
pub use state::HealthState;
