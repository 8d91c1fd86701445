//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the request engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening sockets.
    pub listeners: Vec<BindingConfig>,

    /// Optional TLS configuration. Absent means plaintext.
    pub tls: Option<TlsConfig>,

    /// Socket tuning applied to listeners and accepted connections.
    pub socket: SocketConfig,

    /// Acceptor and I/O worker thread groups.
    pub io: IoConfig,

    /// HTTP codec limits.
    pub codec: CodecConfig,

    /// Business worker pool sizing.
    pub executor: ExecutorConfig,

    /// Reader/writer idle timers.
    pub idle: IdleConfig,

    /// Liveness probe paths.
    pub ping: PingConfig,

    /// Health inspector polling.
    pub health: HealthConfig,

    /// Response defaults.
    pub response: ResponseConfig,

    /// Per-request log record settings.
    pub logging: RequestLogConfig,

    /// Process logging and metrics.
    pub observability: ObservabilityConfig,
}

impl ServerConfig {
    /// A config with a single plaintext listener on the given address and port.
    pub fn with_listener(address: impl Into<String>, port: u16) -> Self {
        Self {
            listeners: vec![BindingConfig {
                address: address.into(),
                port,
            }],
            ..Self::default()
        }
    }
}

/// One listening `(address, port)` pair.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct BindingConfig {
    /// IP address to bind (e.g., "0.0.0.0").
    pub address: String,

    /// TCP port. `0` lets the OS choose.
    pub port: u16,
}

impl std::fmt::Display for BindingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// TLS configuration for the listeners.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// Trusted CA bundle (PEM). When present, client certificates are required.
    #[serde(default)]
    pub trust_ca_path: Option<String>,

    /// Enabled protocol versions ("TLSv1.2", "TLSv1.3").
    #[serde(default = "default_tls_protocols")]
    pub protocols: Vec<String>,

    /// Allowed cipher suite names. Empty keeps the provider defaults.
    #[serde(default)]
    pub ciphers: Vec<String>,

    /// Reject handshakes whose SNI name is not in `server_names`.
    #[serde(default)]
    pub verify_hostname: bool,

    /// Accepted SNI host names when `verify_hostname` is on.
    #[serde(default)]
    pub server_names: Vec<String>,
}

fn default_tls_protocols() -> Vec<String> {
    vec!["TLSv1.3".to_string(), "TLSv1.2".to_string()]
}

/// Socket tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SocketConfig {
    /// Listen backlog.
    pub backlog: u32,

    /// SO_RCVBUF in bytes. `0` keeps the OS default.
    pub recv_buffer: u32,

    /// SO_SNDBUF in bytes. `0` keeps the OS default.
    pub send_buffer: u32,

    /// SO_LINGER in seconds. Negative disables linger.
    pub linger_secs: i64,

    /// SO_KEEPALIVE.
    pub keepalive: bool,

    /// SO_REUSEADDR.
    pub reuse_address: bool,

    /// TCP_NODELAY.
    pub nodelay: bool,

    /// Deadline for the TLS handshake of an accepted connection, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Maximum concurrent connections (backpressure). `0` disables the cap.
    pub max_connections: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            backlog: 1024,
            recv_buffer: 0,
            send_buffer: 0,
            linger_secs: -1,
            keepalive: true,
            reuse_address: true,
            nodelay: true,
            connect_timeout_ms: 5_000,
            max_connections: 10_000,
        }
    }
}

/// I/O thread groups.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct IoConfig {
    /// Threads running the accept loops.
    pub acceptor_threads: usize,

    /// Threads running connection pipelines. `0` means cores * 2 + 1.
    pub worker_threads: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            acceptor_threads: 1,
            worker_threads: 0,
        }
    }
}

impl IoConfig {
    /// Effective I/O worker thread count.
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get() * 2 + 1
        } else {
            self.worker_threads
        }
    }
}

/// HTTP codec limits.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CodecConfig {
    /// Maximum request line length in bytes.
    pub max_initial_line_length: usize,

    /// Maximum size of all request headers in bytes.
    pub max_header_size: usize,

    /// Chunk size used when streaming file responses.
    pub max_chunk_size: usize,

    /// Maximum aggregated request body in bytes.
    pub max_content_length: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_initial_line_length: 4096,
            max_header_size: 8192,
            max_chunk_size: 8192,
            max_content_length: 10 * 1024 * 1024,
        }
    }
}

impl CodecConfig {
    /// Read buffer size handed to the codec. The codec needs at least 8 KiB.
    pub fn read_buffer_size(&self) -> usize {
        (self.max_initial_line_length + self.max_header_size).max(8192)
    }
}

/// How the worker pool is sized.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingMode {
    /// core = max = cores + 1.
    CpuBound,
    /// core = max = cores * 2 + 1.
    IoBound,
    /// Operator supplied core and max.
    #[default]
    Mixed,
}

/// Business worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub mode: ThreadingMode,
    pub core_size: usize,
    pub max_size: usize,
    /// Bounded queue capacity. `0` hands tasks directly to idle workers.
    pub queue_capacity: usize,
    /// Idle time after which non-core workers retire.
    pub keep_alive_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ThreadingMode::Mixed,
            core_size: 8,
            max_size: 64,
            queue_capacity: 1000,
            keep_alive_secs: 60,
        }
    }
}

/// Idle timer configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct IdleConfig {
    /// Close the connection after this many seconds without inbound bytes. `0` disables.
    pub reader_idle_secs: u64,

    /// Send a heartbeat after this many seconds without outbound bytes. `0` disables.
    pub writer_idle_secs: u64,

    /// Bytes written as the heartbeat.
    pub heartbeat_payload: String,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            reader_idle_secs: 0,
            writer_idle_secs: 0,
            heartbeat_payload: "\r\n".to_string(),
        }
    }
}

/// Liveness probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PingConfig {
    /// GET paths answered by the ping handler (exact match).
    pub paths: Vec<String>,

    /// Include the internal failure reason in the response body.
    pub expose_root_cause: bool,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            paths: vec!["/ping".to_string()],
            expose_root_cause: false,
        }
    }
}

/// Health inspector polling.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between inspector runs. `0` disables polling.
    pub inspection_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            inspection_interval_secs: 60,
        }
    }
}

/// Response defaults.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ResponseConfig {
    /// Headers added to every response unless the business overrides them.
    pub default_headers: BTreeMap<String, String>,

    /// Value of the `Server` header. Empty omits it.
    pub server_name: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            default_headers: BTreeMap::new(),
            server_name: format!("request-engine/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Log level of per-request records.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordLevel {
    Off,
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Which POI markers appear in the record.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoiFilter {
    #[default]
    All,
    Only { names: Vec<String> },
    None,
}

/// First verbose filter stage: who called.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallerFilter {
    #[default]
    Any,
    Ids { ids: Vec<i64> },
    Names { names: Vec<String> },
    Groups { groups: Vec<String> },
    Roles { roles: Vec<String> },
}

/// Second verbose filter stage: what came back.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseCodeFilter {
    Any,
    HttpStatus { min: u16, max: u16 },
    AppErrorCode { min: i32, max: i32 },
    None,
}

impl Default for ResponseCodeFilter {
    fn default() -> Self {
        ResponseCodeFilter::HttpStatus { min: 400, max: 599 }
    }
}

/// Verbose dump policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct VerboseConfig {
    pub caller: CallerFilter,
    pub response_code: ResponseCodeFilter,
    pub request_header: bool,
    pub request_body: bool,
    pub response_header: bool,
    pub response_body: bool,
}

impl Default for VerboseConfig {
    fn default() -> Self {
        Self {
            caller: CallerFilter::Any,
            response_code: ResponseCodeFilter::default(),
            request_header: true,
            request_body: true,
            response_header: true,
            response_body: true,
        }
    }
}

/// Per-request log record configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RequestLogConfig {
    pub level: RecordLevel,

    /// Response time above which the record is marked OVERTIME and raised to WARN.
    pub overtime_threshold_ms: u64,

    pub poi: PoiFilter,

    pub verbose: VerboseConfig,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self {
            level: RecordLevel::Info,
            overtime_threshold_ms: 3_000,
            poi: PoiFilter::All,
            verbose: VerboseConfig::default(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines.
    pub json_logs: bool,

    /// Occupancy sampler period in milliseconds.
    pub sample_interval_ms: u64,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            sample_interval_ms: 1_000,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
