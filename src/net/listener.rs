//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to configured address(es) with socket tuning applied
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Turn bind failures into an actionable diagnostic
//!
//! # Design Decisions
//! - Bind failures are fatal and never retried: a busy or forbidden port
//!   is an operator error

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{BindingConfig, SocketConfig};

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind {binding}: {source}. {hint}")]
    Bind {
        binding: String,
        #[source]
        source: std::io::Error,
        hint: String,
    },
    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(#[source] std::io::Error),
}

impl ListenerError {
    fn bind(binding: &BindingConfig, source: std::io::Error) -> Self {
        let hint = bind_hint(binding.port, &source);
        ListenerError::Bind {
            binding: binding.to_string(),
            source,
            hint,
        }
    }
}

/// Operator-facing advice for a failed bind.
pub fn bind_hint(port: u16, error: &std::io::Error) -> String {
    let find = if cfg!(windows) {
        format!("`netstat -ano | findstr :{port}`")
    } else {
        format!("`lsof -i :{port}` or `netstat -tulpn | grep :{port}`")
    };
    match error.kind() {
        std::io::ErrorKind::AddrInUse => {
            format!("Port {port} is already in use; find the owning process with {find}")
        }
        std::io::ErrorKind::PermissionDenied => {
            format!("Binding port {port} requires elevated privileges; choose a port above 1024 or grant the capability")
        }
        std::io::ErrorKind::AddrNotAvailable => {
            "The address is not assigned to any local interface; check the configured address".to_string()
        }
        _ => format!("Check the listener configuration; processes using the port can be listed with {find}"),
    }
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Semaphore to limit concurrent connections, if capped.
    connection_limit: Option<Arc<Semaphore>>,
    nodelay: bool,
}

impl Listener {
    /// Bind one configured address. Must run inside a tokio runtime context.
    pub fn bind(binding: &BindingConfig, socket: &SocketConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = binding.to_string().parse().map_err(|e| {
            ListenerError::bind(binding, std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let listener = Self::tuned_socket(addr, socket)
            .and_then(|s| s.listen(socket.backlog))
            .map_err(|e| ListenerError::bind(binding, e))?;

        let local_addr = listener.local_addr().map_err(|e| ListenerError::bind(binding, e))?;

        tracing::info!(
            address = %local_addr,
            backlog = socket.backlog,
            max_connections = socket.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: (socket.max_connections > 0)
                .then(|| Arc::new(Semaphore::new(socket.max_connections))),
            nodelay: socket.nodelay,
        })
    }

    fn tuned_socket(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(config.reuse_address)?;
        socket.set_keepalive(config.keepalive)?;
        if config.recv_buffer > 0 {
            socket.set_recv_buffer_size(config.recv_buffer)?;
        }
        if config.send_buffer > 0 {
            socket.set_send_buffer_size(config.send_buffer)?;
        }
        if config.linger_secs >= 0 {
            socket.set_linger(Some(Duration::from_secs(config.linger_secs as u64)))?;
        }
        socket.bind(addr)?;
        Ok(socket)
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = match &self.connection_limit {
            Some(limit) => Some(
                limit
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| ListenerError::Accept(std::io::Error::other(e)))?,
            ),
            None => None,
        };

        // Then accept the connection
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        if let Err(e) = stream.set_nodelay(self.nodelay) {
            tracing::debug!(peer_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::debug!(
            peer_addr = %addr,
            available_permits = ?self.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> Option<usize> {
        self.connection_limit.as_ref().map(|s| s.available_permits())
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}
