//! Connection-level behavior: probes, idle timers, interception stages and reload.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use request_engine::http::WebSocketHandler;
use request_engine::net::ChannelInfo;
use request_engine::config::BindingConfig;
use request_engine::{AppError, HttpServer, RequestFacts, ResponseContext, ServerError, ServiceError};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

mod common;

fn ok(_: &RequestFacts, ctx: &mut ResponseContext) -> Result<(), ServiceError> {
    ctx.set_text("ok");
    Ok(())
}

fn addr_of(base: &str) -> SocketAddr {
    base.trim_start_matches("http://").parse().unwrap()
}

#[tokio::test]
async fn ping_reflects_health_and_pause() {
    let mut config = common::test_config();
    config.ping.paths = vec!["/ping".into(), "/healthz".into()];
    let (server, base) = common::start_with(config, ok);
    let client = common::client();

    let res = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(res.status(), 200);

    server.health().set_health_check_failed(true, Some("db down".into()));
    let res = client.get(format!("{base}/ping")).send().await.unwrap();
    assert_eq!(res.status(), 502);
    assert_eq!(res.text().await.unwrap(), "Bad Gateway");

    server.health().set_paused(true, Some("maintenance".into()));
    let res = client.get(format!("{base}/ping")).send().await.unwrap();
    assert_eq!(res.status(), 503);

    assert_eq!(server.counters().ping_hits(), 3);
    assert_eq!(server.counters().biz_hits(), 0);
}

#[tokio::test]
async fn inspector_failures_surface_on_ping() {
    let mut config = common::test_config();
    config.health.inspection_interval_secs = 1;
    config.ping.expose_root_cause = true;
    let inspector = || vec![AppError::new(42, "cache unreachable")];
    let builder = HttpServer::builder(config, ok).inspector(inspector);
    let (_server, base) = common::start(builder);
    let client = common::client();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let res = client.get(format!("{base}/ping")).send().await.unwrap();
    assert_eq!(res.status(), 502);
    assert_eq!(res.text().await.unwrap(), "42: cache unreachable");
}

#[tokio::test]
async fn reader_idle_closes_silent_connection() {
    let mut config = common::test_config();
    config.idle.reader_idle_secs = 1;
    let (server, base) = common::start_with(config, ok);

    let mut stream = TcpStream::connect(addr_of(&base)).await.unwrap();
    let started = Instant::now();
    let received = common::read_until_closed(&mut stream, Duration::from_secs(5)).await;
    assert!(received.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(started.elapsed() < Duration::from_secs(3));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.counters().active_channels(), 0);
}

#[tokio::test]
async fn writer_idle_sends_heartbeat() {
    let mut config = common::test_config();
    config.idle.writer_idle_secs = 1;
    config.idle.heartbeat_payload = "\r\n".into();
    let (_server, base) = common::start_with(config, ok);

    let mut stream = TcpStream::connect(addr_of(&base)).await.unwrap();
    let mut buf = [0u8; 2];
    let read = tokio::time::timeout(Duration::from_secs(3), tokio::io::AsyncReadExt::read_exact(&mut stream, &mut buf)).await;
    assert!(read.is_ok(), "no heartbeat within the writer idle period");
    assert_eq!(&buf, b"\r\n");
}

#[tokio::test]
async fn multipart_without_upload_handler_closes_connection() {
    let (server, base) = common::start_with(common::test_config(), ok);
    let request = b"POST /upload HTTP/1.1\r\nHost: localhost\r\n\
        Content-Type: multipart/form-data; boundary=xyz\r\nContent-Length: 0\r\n\r\n";

    let response = common::raw_exchange(addr_of(&base), request).await;
    assert!(!response.starts_with(b"HTTP/1.1"), "{}", String::from_utf8_lossy(&response));
    assert_eq!(server.counters().biz_hits(), 0);
}

#[tokio::test]
async fn oversize_body_gets_413() {
    let mut config = common::test_config();
    config.codec.max_content_length = 16;
    let (server, base) = common::start_with(config, ok);
    let client = common::client();

    let res = client.post(format!("{base}/echo")).body("x".repeat(64)).send().await.unwrap();
    assert_eq!(res.status(), 413);
    assert!(res.headers().contains_key("x-request-id"));
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], 1010);

    let res = client.post(format!("{base}/echo")).body("small").send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(server.counters().biz_hits(), 1);
}

struct Echo;

impl WebSocketHandler for Echo {
    fn on_message(&self, _channel: &ChannelInfo, message: Message) -> Option<Message> {
        Some(message)
    }
}

#[tokio::test]
async fn websocket_echo_on_registered_path() {
    let builder = HttpServer::builder(common::test_config(), ok).websocket("/ws", Echo);
    let (_server, base) = common::start(builder);
    let url = format!("ws://{}/ws", addr_of(&base));

    let (mut ws, response) = tokio_tungstenite::connect_async(url).await.unwrap();
    assert_eq!(response.status(), 101);
    ws.send(Message::text("hello")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), "hello");
    ws.close(None).await.unwrap();

    // plain requests on other paths still reach the business service
    let res = common::client().get(format!("{base}/other")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn reload_rebinds_and_resizes() {
    let (server, base) = common::start_with(common::test_config(), ok);
    let old_addr = addr_of(&base);

    let mut config = common::test_config();
    config.socket.max_connections = 64;
    config.executor.core_size = 2;
    config.executor.max_size = 3;
    config.response.default_headers.insert("x-engine".into(), "reloaded".into());
    server.reload(config).await.unwrap();

    let new_addr = server.local_addrs()[0];
    assert_ne!(new_addr, old_addr);
    assert_eq!(server.executor().stats().core, 2);
    assert_eq!(server.executor().stats().max, 3);

    let res = common::client().get(format!("http://{new_addr}/")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["x-engine"], "reloaded");
    assert!(TcpStream::connect(old_addr).await.is_err());
}

#[tokio::test]
async fn invalid_reload_keeps_running_config() {
    let (server, base) = common::start_with(common::test_config(), ok);

    let mut config = common::test_config();
    config.executor.core_size = 0;
    assert!(server.reload(config).await.is_err());

    let res = common::client().get(format!("{base}/")).send().await.unwrap();
    assert_eq!(res.status(), 200);
}

#[tokio::test]
async fn reload_with_unbindable_address_changes_nothing() {
    let (server, base) = common::start_with(common::test_config(), ok);
    let before = server.local_addrs();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = occupied.local_addr().unwrap().port();

    let mut config = common::test_config();
    config.socket.backlog = 2048;
    config.executor.core_size = 2;
    config.listeners.push(BindingConfig {
        address: "127.0.0.1".into(),
        port: taken,
    });
    let err = server.reload(config).await.unwrap_err();
    assert!(matches!(err, ServerError::Bind(_)), "{err}");

    assert_eq!(server.local_addrs(), before);
    assert_eq!(server.config().socket.backlog, common::test_config().socket.backlog);
    assert_eq!(server.executor().stats().core, 4);
    let res = common::client().get(format!("{base}/")).send().await.unwrap();
    assert_eq!(res.status(), 200);
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (server, base) = common::start_with(common::test_config(), ok);
    let addr = addr_of(&base);
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    server.shutdown();
    server.stopped().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}
