//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → shared via ArcSwap to all subsystems
//!
//! On reload signal:
//!     watcher.rs detects change (or SIGHUP)
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → ServerHandle::reload swaps the snapshot
//!     → new connections and requests observe the new config
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BindingConfig, CallerFilter, CodecConfig, ExecutorConfig, HealthConfig, IdleConfig, IoConfig,
    ObservabilityConfig, PingConfig, PoiFilter, RecordLevel, RequestLogConfig, ResponseCodeFilter,
    ResponseConfig, ServerConfig, SocketConfig, ThreadingMode, TlsConfig, VerboseConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
