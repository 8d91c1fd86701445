//! Server bootstrap.
//!
//! # Responsibilities
//! - Validate the config and build the shared engine (pool, TLS, defaults)
//! - Run accept loops on the acceptor runtime and connections on the I/O runtime
//! - Start the occupancy sampler, health inspector and metrics exporter
//! - Apply reloads and shut everything down in order
//!
//! # Design Decisions
//! - `start()` is synchronous and owns both runtimes, so the engine can be
//!   embedded in programs with or without their own runtime
//! - Bind failures are fatal; runtimes built so far are torn down
//! - Accepted sockets cross runtimes as std sockets and are re-registered
//!   with the I/O runtime's reactor

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{validate_config, BindingConfig, ServerConfig, ValidationError};
use crate::executor::{resolve_sizing, ExecutorHandle, PoolSizing};
use crate::health::{HealthInspector, HealthMonitor, HealthState};
use crate::http::dispatch::Dispatcher;
use crate::http::ping::{NoopPingLifecycle, PingLifecycle};
use crate::http::pipeline::{serve_connection, Engine};
use crate::http::response::ResponseDefaults;
use crate::http::upload::UploadHandler;
use crate::http::websocket::WebSocketHandler;
use crate::lifecycle::Shutdown;
use crate::net::{Listener, ListenerError, TlsContext, TlsError};
use crate::observability::metrics::init_metrics;
use crate::observability::{Counters, LoggingStatusListener, RequestLogger, Sampler, StatusListener};
use crate::service::{BizService, ErrorHandlers, NoopLifecycle, ServiceLifecycle};

const EXECUTOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const RUNTIME_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while starting or reconfiguring the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
    #[error(transparent)]
    Bind(#[from] ListenerError),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),
    #[error("failed to build {name} runtime: {source}")]
    Runtime {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("listener I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("server is shut down")]
    ShutDown,
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl From<ValidationError> for ServerError {
    fn from(error: ValidationError) -> Self {
        ServerError::Validation(vec![error])
    }
}

/// Entry point for building a server.
pub struct HttpServer;

impl HttpServer {
    pub fn builder(config: ServerConfig, service: impl BizService) -> ServerBuilder {
        ServerBuilder {
            config,
            service: Arc::new(service),
            lifecycle: Arc::new(NoopLifecycle),
            error_handlers: ErrorHandlers::new(),
            ping_lifecycle: Arc::new(NoopPingLifecycle),
            upload: None,
            websockets: HashMap::new(),
            inspector: None,
            status_listener: Arc::new(LoggingStatusListener),
        }
    }
}

/// Collects the injectable parts of a server.
pub struct ServerBuilder {
    config: ServerConfig,
    service: Arc<dyn BizService>,
    lifecycle: Arc<dyn ServiceLifecycle>,
    error_handlers: ErrorHandlers,
    ping_lifecycle: Arc<dyn PingLifecycle>,
    upload: Option<Arc<dyn UploadHandler>>,
    websockets: HashMap<String, Arc<dyn WebSocketHandler>>,
    inspector: Option<Arc<dyn HealthInspector>>,
    status_listener: Arc<dyn StatusListener>,
}

impl ServerBuilder {
    pub fn lifecycle(mut self, lifecycle: impl ServiceLifecycle) -> Self {
        self.lifecycle = Arc::new(lifecycle);
        self
    }

    pub fn error_handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.error_handlers = handlers;
        self
    }

    pub fn ping_lifecycle(mut self, lifecycle: impl PingLifecycle) -> Self {
        self.ping_lifecycle = Arc::new(lifecycle);
        self
    }

    pub fn upload(mut self, handler: impl UploadHandler) -> Self {
        self.upload = Some(Arc::new(handler));
        self
    }

    pub fn websocket(mut self, path: impl Into<String>, handler: impl WebSocketHandler) -> Self {
        self.websockets.insert(path.into(), Arc::new(handler));
        self
    }

    pub fn inspector(mut self, inspector: impl HealthInspector) -> Self {
        self.inspector = Some(Arc::new(inspector));
        self
    }

    pub fn status_listener(mut self, listener: impl StatusListener) -> Self {
        self.status_listener = Arc::new(listener);
        self
    }

    /// Validate, bind and start serving.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        validate_config(&self.config).map_err(ServerError::Validation)?;
        let sizing = resolve_sizing(&self.config.executor, num_cpus::get())?;
        let defaults = ResponseDefaults::from_config(&self.config.response)?;
        let tls = self.config.tls.as_ref().map(TlsContext::from_config).transpose()?;

        let acceptor = build_runtime("acceptor", self.config.io.acceptor_threads)?;
        let io = match build_runtime("io-worker", self.config.io.resolved_worker_threads()) {
            Ok(io) => io,
            Err(e) => {
                acceptor.shutdown_background();
                return Err(e);
            }
        };

        match self.launch(&acceptor, &io, sizing, defaults, tls) {
            Ok(parts) => Ok(ServerHandle::assemble(parts, acceptor, io)),
            Err(e) => {
                tracing::error!(error = %e, "Server startup failed");
                acceptor.shutdown_background();
                io.shutdown_background();
                Err(e)
            }
        }
    }

    fn launch(
        self,
        acceptor: &Runtime,
        io: &Runtime,
        sizing: PoolSizing,
        defaults: ResponseDefaults,
        tls: Option<TlsContext>,
    ) -> Result<Launched, ServerError> {
        let config = self.config;
        let counters = Arc::new(Counters::new());
        let health = Arc::new(HealthState::new());
        let shutdown = Shutdown::new();
        let executor = ExecutorHandle::new(sizing);
        let logger = Arc::new(RequestLogger::new(config.logging.clone()));

        let dispatcher = Arc::new(Dispatcher::new(
            executor.clone(),
            self.service,
            self.lifecycle,
            Arc::new(self.error_handlers),
            Arc::clone(&counters),
            Arc::clone(&logger),
        ));

        let engine = Arc::new(Engine {
            config: ArcSwap::from_pointee(config.clone()),
            tls: ArcSwapOption::new(tls.map(Arc::new)),
            defaults: ArcSwap::from_pointee(defaults),
            dispatcher,
            counters: Arc::clone(&counters),
            health: Arc::clone(&health),
            ping_lifecycle: self.ping_lifecycle,
            upload: self.upload,
            websockets: self.websockets,
            shutdown: shutdown.subscribe(),
        });

        let mut staged = Vec::with_capacity(config.listeners.len());
        for binding in &config.listeners {
            staged.push(bind_listener(acceptor.handle(), binding, &config)?);
        }
        let listeners: Vec<BoundListener> = staged
            .into_iter()
            .map(|staged| spawn_accept(acceptor.handle(), io.handle(), staged, &engine, &shutdown))
            .collect();

        tracing::info!(
            backend = io_backend(),
            acceptor_threads = config.io.acceptor_threads,
            io_threads = config.io.resolved_worker_threads(),
            pool_core = sizing.core,
            pool_max = sizing.max,
            pool_queue = sizing.queue_capacity,
            tls = config.tls.is_some(),
            "Request engine started"
        );

        let period = Duration::from_millis(config.observability.sample_interval_ms.max(1));
        let sampler = Sampler::new(Arc::clone(&counters), executor.clone(), self.status_listener);
        acceptor.spawn(sampler.run(period, shutdown.subscribe()));

        if let Some(inspector) = self.inspector {
            let interval = config.health.inspection_interval_secs;
            if interval > 0 {
                let monitor = HealthMonitor::new(inspector, Arc::clone(&health));
                acceptor.spawn(monitor.run(Duration::from_secs(interval), shutdown.subscribe()));
            }
        }

        if config.observability.metrics_enabled {
            match config.observability.metrics_address.parse::<SocketAddr>() {
                Ok(addr) => {
                    let _enter = acceptor.enter();
                    if let Err(e) = init_metrics(addr) {
                        tracing::error!(address = %addr, error = %e, "Failed to start metrics exporter");
                    }
                }
                Err(e) => tracing::error!(
                    address = %config.observability.metrics_address,
                    error = %e,
                    "Invalid metrics address"
                ),
            }
        }

        Ok(Launched {
            engine,
            executor,
            logger,
            counters,
            health,
            shutdown,
            listeners,
        })
    }
}

struct Launched {
    engine: Arc<Engine>,
    executor: ExecutorHandle,
    logger: Arc<RequestLogger>,
    counters: Arc<Counters>,
    health: Arc<HealthState>,
    shutdown: Shutdown,
    listeners: Vec<BoundListener>,
}

struct BoundListener {
    binding: BindingConfig,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Running server. Dropping it shuts the server down.
pub struct ServerHandle {
    engine: Arc<Engine>,
    executor: ExecutorHandle,
    logger: Arc<RequestLogger>,
    counters: Arc<Counters>,
    health: Arc<HealthState>,
    shutdown: Shutdown,
    listeners: Mutex<Vec<BoundListener>>,
    acceptor_handle: Handle,
    io_handle: Handle,
    acceptor: Mutex<Option<Runtime>>,
    io: Mutex<Option<Runtime>>,
}

impl ServerHandle {
    fn assemble(parts: Launched, acceptor: Runtime, io: Runtime) -> Self {
        Self {
            engine: parts.engine,
            executor: parts.executor,
            logger: parts.logger,
            counters: parts.counters,
            health: parts.health,
            shutdown: parts.shutdown,
            listeners: Mutex::new(parts.listeners),
            acceptor_handle: acceptor.handle().clone(),
            io_handle: io.handle().clone(),
            acceptor: Mutex::new(Some(acceptor)),
            io: Mutex::new(Some(io)),
        }
    }

    /// Actual bound addresses, in binding order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.lock().iter().map(|l| l.local_addr).collect()
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn executor(&self) -> &ExecutorHandle {
        &self.executor
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.engine.config.load_full()
    }

    /// Apply a new configuration. Nothing is changed when validation or a
    /// bind on a fresh address fails.
    pub async fn reload(&self, config: ServerConfig) -> Result<(), ServerError> {
        if self.shutdown.is_triggered() {
            return Err(ServerError::ShutDown);
        }
        validate_config(&config).map_err(ServerError::Validation)?;
        let sizing = resolve_sizing(&config.executor, num_cpus::get())?;
        let defaults = ResponseDefaults::from_config(&config.response)?;
        let tls = config.tls.as_ref().map(TlsContext::from_config).transpose()?;

        let previous = self.engine.config.load_full();
        self.rebind(&previous, &config).await?;

        self.engine.tls.store(tls.map(Arc::new));
        self.engine.defaults.store(Arc::new(defaults));
        self.executor.resize(sizing);
        self.logger.reload(config.logging.clone());
        self.engine.config.store(Arc::new(config));
        tracing::info!(listeners = self.listeners.lock().len(), "Configuration reloaded");
        Ok(())
    }

    /// Swap the listener set to match `config`.
    ///
    /// Fresh addresses are bound while the old listeners still serve, so a
    /// failure there leaves everything untouched. Addresses that must be
    /// released before they can be bound again are rebound after retirement;
    /// if that fails the retired bindings are restored with the previous
    /// socket settings.
    async fn rebind(&self, previous: &ServerConfig, config: &ServerConfig) -> Result<(), ServerError> {
        let socket_changed = previous.socket != config.socket;
        let (kept, retiring): (Vec<BindingConfig>, Vec<BindingConfig>) = self
            .listeners
            .lock()
            .iter()
            .map(|l| l.binding.clone())
            .partition(|b| !socket_changed && config.listeners.contains(b));

        let (reused, fresh): (Vec<&BindingConfig>, Vec<&BindingConfig>) = config
            .listeners
            .iter()
            .filter(|b| !kept.contains(*b))
            .partition(|b| b.port != 0 && retiring.contains(*b));

        let mut staged = Vec::with_capacity(fresh.len() + reused.len());
        for binding in fresh {
            staged.push(bind_listener(&self.acceptor_handle, binding, config)?);
        }

        let retired: Vec<BoundListener> = {
            let mut listeners = self.listeners.lock();
            let (keep, retire): (Vec<_>, Vec<_>) = listeners.drain(..).partition(|l| kept.contains(&l.binding));
            *listeners = keep;
            retire
        };
        for listener in retired {
            listener.cancel.cancel();
            if let Err(e) = listener.task.await {
                tracing::warn!(binding = %listener.binding, error = %e, "Accept loop ended abnormally");
            }
            tracing::info!(binding = %listener.binding, "Listener closed");
        }

        for binding in reused {
            match bind_listener(&self.acceptor_handle, binding, config) {
                Ok(listener) => staged.push(listener),
                Err(e) => {
                    drop(staged);
                    self.restore(&retiring, previous);
                    return Err(e);
                }
            }
        }

        let mut listeners = self.listeners.lock();
        for staged in staged {
            listeners.push(self.activate(staged));
        }
        Ok(())
    }

    /// Best effort return to the previous listener set after a failed rebind.
    fn restore(&self, bindings: &[BindingConfig], previous: &ServerConfig) {
        for binding in bindings {
            match bind_listener(&self.acceptor_handle, binding, previous) {
                Ok(staged) => {
                    let listener = self.activate(staged);
                    self.listeners.lock().push(listener);
                }
                Err(e) => tracing::error!(binding = %binding, error = %e, "Failed to restore listener"),
            }
        }
    }

    fn activate(&self, staged: StagedListener) -> BoundListener {
        spawn_accept(&self.acceptor_handle, &self.io_handle, staged, &self.engine, &self.shutdown)
    }

    /// Stop accepting, drain, stop the pool and both runtimes. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        tracing::info!("Request engine shutting down");
        for listener in self.listeners.lock().drain(..) {
            listener.cancel.cancel();
        }
        self.executor.shutdown();

        // Blocking waits are only allowed outside of async contexts.
        let in_runtime = Handle::try_current().is_ok();
        if !in_runtime {
            let deadline = Instant::now() + CONNECTION_DRAIN_TIMEOUT;
            while self.counters.active_channels() > 0 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if !self.executor.await_termination(EXECUTOR_DRAIN_TIMEOUT) {
                tracing::warn!("Worker pool did not terminate before deadline");
            }
        }

        for runtime in [self.io.lock().take(), self.acceptor.lock().take()].into_iter().flatten() {
            if in_runtime {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(RUNTIME_STOP_TIMEOUT);
            }
        }
        tracing::info!("Request engine stopped");
    }

    /// Resolves once shutdown has been triggered.
    pub async fn stopped(&self) {
        self.shutdown.triggered().await;
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_runtime(name: &'static str, threads: usize) -> Result<Runtime, ServerError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads.max(1))
        .thread_name(name)
        .enable_all()
        .build()
        .map_err(|source| ServerError::Runtime { name, source })
}

/// A bound socket whose accept loop has not started yet.
struct StagedListener {
    binding: BindingConfig,
    local_addr: SocketAddr,
    listener: Listener,
}

fn bind_listener(acceptor: &Handle, binding: &BindingConfig, config: &ServerConfig) -> Result<StagedListener, ServerError> {
    let listener = {
        let _enter = acceptor.enter();
        Listener::bind(binding, &config.socket)?
    };
    let local_addr = listener.local_addr()?;
    Ok(StagedListener {
        binding: binding.clone(),
        local_addr,
        listener,
    })
}

fn spawn_accept(
    acceptor: &Handle,
    io: &Handle,
    staged: StagedListener,
    engine: &Arc<Engine>,
    shutdown: &Shutdown,
) -> BoundListener {
    let cancel = shutdown.subscribe();
    tracing::info!(binding = %staged.binding, address = %staged.local_addr, "Listening");
    let task = acceptor.spawn(accept_loop(staged.listener, Arc::clone(engine), io.clone(), cancel.clone()));
    BoundListener {
        binding: staged.binding,
        local_addr: staged.local_addr,
        cancel,
        task,
    }
}

async fn accept_loop(listener: Listener, engine: Arc<Engine>, io: Handle, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer, permit) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to detach accepted socket");
                continue;
            }
        };
        let engine = Arc::clone(&engine);
        io.spawn(async move {
            match TcpStream::from_std(stream) {
                Ok(stream) => serve_connection(engine, stream, permit).await,
                Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to register accepted socket"),
            }
        });
    }
}

/// Readiness backend of the platform's reactor.
pub fn io_backend() -> &'static str {
    if cfg!(any(target_os = "linux", target_os = "android", target_os = "illumos")) {
        "epoll"
    } else if cfg!(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )) {
        "kqueue"
    } else if cfg!(windows) {
        "iocp"
    } else {
        "poll"
    }
}
