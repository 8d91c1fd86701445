//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use request_engine::config::ServerConfig;
use request_engine::http::ServerBuilder;
use request_engine::{BizService, HttpServer, ServerHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Loopback config with an OS-assigned port and a small I/O group.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::with_listener("127.0.0.1", 0);
    config.io.worker_threads = 2;
    config.executor.core_size = 4;
    config.executor.max_size = 8;
    config.observability.sample_interval_ms = 100;
    config
}

/// Start a server and return it with the base URL of its first listener.
pub fn start(builder: ServerBuilder) -> (ServerHandle, String) {
    let server = builder.start().expect("server should start");
    let addr = server.local_addrs()[0];
    (server, format!("http://{addr}"))
}

pub fn start_with(config: ServerConfig, service: impl BizService) -> (ServerHandle, String) {
    start(HttpServer::builder(config, service))
}

/// A client that neither follows redirects nor reuses connections.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Write raw bytes and read until the server closes the connection.
/// A reset counts as a close.
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    read_until_closed(&mut stream, Duration::from_secs(5)).await
}

pub async fn read_until_closed(stream: &mut TcpStream, limit: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    let read = async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
    };
    tokio::time::timeout(limit, read)
        .await
        .expect("server should close the connection");
    out
}
