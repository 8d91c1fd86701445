//! Asynchronous network request engine.
//!
//! Accepts HTTP/1.1 (optionally TLS) connections, runs each through a
//! per-connection pipeline and hands business requests to a bounded worker
//! pool, answering 429 when the pool is saturated.

pub mod config;
pub mod executor;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod service;

pub use config::ServerConfig;
pub use health::{HealthInspector, HealthState};
pub use http::{HttpServer, RequestFacts, ResponseContext, ServerError, ServerHandle};
pub use lifecycle::Shutdown;
pub use service::{AppError, BizService, ErrorKind, ServiceError, ServiceLifecycle};
