//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, socket tuning, connection limits)
//!     → tls.rs (optional TLS handshake, SNI check)
//!     → idle.rs (reader/writer idle stamps, heartbeat)
//!     → connection.rs (identity, channel counters)
//!     → Hand off to the HTTP pipeline
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - TLS is optional and handled transparently
//! - Idle detection wraps the transport, below the HTTP codec

pub mod connection;
pub mod idle;
pub mod listener;
pub mod tls;

pub use connection::{ChannelInfo, ConnectionGuard, ConnectionId};
pub use idle::{watch_idle, IdlePolicy, IdleState, IdleStream};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use tls::{TlsContext, TlsError};
