//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! connection guard, dispatch, ping
//!     → counters.rs (process-wide atomics)
//!     → sampler.rs (periodic drain → StatusListener, metrics gauges)
//!
//! completed request
//!     → request_log.rs (one multi-line record, two-stage verbose filter)
//!
//! everything else
//!     → logging.rs (tracing subscriber)
//! ```
//!
//! # Design Decisions
//! - Counters are injected by handle, never looked up globally
//! - Metrics are cheap (atomic increments) and optional

pub mod counters;
pub mod logging;
pub mod metrics;
pub mod request_log;
pub mod sampler;

pub use counters::Counters;
pub use request_log::{RequestLogger, RequestRecord, ACCESS_TARGET};
pub use sampler::{LoggingStatusListener, Sampler, StatusListener, StatusSample};
