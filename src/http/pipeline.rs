//! Per-connection pipeline composition and serving.
//!
//! # Stage order
//! ```text
//! [tls] → [reader idle] → [writer idle] → http codec → chunked writer
//!       → file upload | reject multipart → aggregator → [websocket]
//!       → ping → dispatch
//! ```
//! Optional stages in brackets are present only when configured. TLS wraps
//! every byte; idle stamps sit below the codec so they see raw traffic;
//! upload interception precedes aggregation so uploads stream; ping
//! precedes dispatch so probes never use worker capacity.
//!
//! # Design Decisions
//! - The stage list is built once per accepted connection from a config
//!   snapshot and never changes afterwards; reloads apply to new connections
//! - WebSocket upgrades are taken before body collection because the
//!   upgrade needs the original request (handshakes carry no body)

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use http::header::{CONNECTION, CONTENT_LENGTH};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::http::context::accepts_xml;
use crate::http::dispatch::{panic_message, transaction_id, Dispatcher, ResponseSettings};
use crate::http::ping::{PingHandler, PingLifecycle};
use crate::http::response::{self, ResponseBody, ResponseDefaults, SendError};
use crate::http::upload::{self, UploadError, UploadHandler};
use crate::http::websocket::{self, WebSocketHandler};
use crate::health::HealthState;
use crate::net::{watch_idle, ChannelInfo, ConnectionGuard, ConnectionPermit, IdlePolicy, IdleState, IdleStream, TlsContext};
use crate::observability::Counters;
use crate::service::{codes, AppError};

/// How long an in-flight request may take to finish once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One stage of a connection's pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Tls { verify_hostname: bool },
    ReaderIdle(Duration),
    WriterIdle(Duration),
    HttpCodec { max_initial_line: usize, max_header_size: usize },
    ChunkedWriter { max_chunk_size: usize },
    FileUpload,
    RejectMultipart,
    Aggregator { max_content_length: usize },
    WebSocket { paths: Vec<String> },
    Ping { paths: Vec<String> },
    Dispatch,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Tls { .. } => "tls",
            Stage::ReaderIdle(_) => "reader-idle",
            Stage::WriterIdle(_) => "writer-idle",
            Stage::HttpCodec { .. } => "http-codec",
            Stage::ChunkedWriter { .. } => "chunked-writer",
            Stage::FileUpload => "file-upload",
            Stage::RejectMultipart => "reject-multipart",
            Stage::Aggregator { .. } => "aggregator",
            Stage::WebSocket { .. } => "websocket",
            Stage::Ping { .. } => "ping",
            Stage::Dispatch => "dispatch",
        }
    }
}

/// Builds the stage list for one connection.
#[derive(Debug)]
pub struct PipelineBuilder<'a> {
    config: &'a ServerConfig,
    tls: bool,
    upload: bool,
    websocket_paths: Vec<String>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(config: &'a ServerConfig) -> Self {
        Self {
            config,
            tls: false,
            upload: false,
            websocket_paths: Vec::new(),
        }
    }

    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    pub fn upload(mut self, registered: bool) -> Self {
        self.upload = registered;
        self
    }

    pub fn websocket_paths(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.websocket_paths = paths.into_iter().collect();
        self.websocket_paths.sort();
        self
    }

    pub fn build(self) -> Pipeline {
        let c = self.config;
        let mut stages = Vec::with_capacity(11);

        if self.tls {
            let verify_hostname = c.tls.as_ref().is_some_and(|t| t.verify_hostname);
            stages.push(Stage::Tls { verify_hostname });
        }
        if c.idle.reader_idle_secs > 0 {
            stages.push(Stage::ReaderIdle(Duration::from_secs(c.idle.reader_idle_secs)));
        }
        if c.idle.writer_idle_secs > 0 {
            stages.push(Stage::WriterIdle(Duration::from_secs(c.idle.writer_idle_secs)));
        }
        stages.push(Stage::HttpCodec {
            max_initial_line: c.codec.max_initial_line_length,
            max_header_size: c.codec.max_header_size,
        });
        stages.push(Stage::ChunkedWriter {
            max_chunk_size: c.codec.max_chunk_size,
        });
        stages.push(if self.upload {
            Stage::FileUpload
        } else {
            Stage::RejectMultipart
        });
        stages.push(Stage::Aggregator {
            max_content_length: c.codec.max_content_length,
        });
        if !self.websocket_paths.is_empty() {
            stages.push(Stage::WebSocket {
                paths: self.websocket_paths,
            });
        }
        stages.push(Stage::Ping {
            paths: c.ping.paths.clone(),
        });
        stages.push(Stage::Dispatch);

        Pipeline {
            stages,
            read_buffer_size: c.codec.read_buffer_size(),
            idle: IdlePolicy::from_config(&c.idle),
        }
    }
}

/// Immutable stage list of one connection.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    read_buffer_size: usize,
    idle: IdlePolicy,
}

impl Pipeline {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    fn has(&self, name: &str) -> bool {
        self.stages.iter().any(|s| s.name() == name)
    }

    fn max_content_length(&self) -> usize {
        self.stages
            .iter()
            .find_map(|s| match s {
                Stage::Aggregator { max_content_length } => Some(*max_content_length),
                _ => None,
            })
            .unwrap_or(usize::MAX)
    }

    fn max_chunk_size(&self) -> usize {
        self.stages
            .iter()
            .find_map(|s| match s {
                Stage::ChunkedWriter { max_chunk_size } => Some(*max_chunk_size),
                _ => None,
            })
            .unwrap_or(8192)
    }
}

/// Why a connection was closed without a response.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("multipart upload without a registered upload handler")]
    MultipartRejected,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("request body failed: {0}")]
    Body(Box<dyn std::error::Error + Send + Sync>),
    #[error("ping response vetoed")]
    PingVetoed,
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("request handling panicked: {0}")]
    Panicked(String),
}

/// Everything connections share. Reloadable parts are swapped in place.
pub struct Engine {
    pub config: arc_swap::ArcSwap<ServerConfig>,
    pub tls: arc_swap::ArcSwapOption<TlsContext>,
    pub defaults: arc_swap::ArcSwap<ResponseDefaults>,
    pub dispatcher: Arc<Dispatcher>,
    pub counters: Arc<Counters>,
    pub health: Arc<HealthState>,
    pub ping_lifecycle: Arc<dyn PingLifecycle>,
    pub upload: Option<Arc<dyn UploadHandler>>,
    pub websockets: HashMap<String, Arc<dyn WebSocketHandler>>,
    pub shutdown: CancellationToken,
}

/// Serve one accepted TCP connection until it closes.
pub async fn serve_connection(engine: Arc<Engine>, stream: TcpStream, permit: ConnectionPermit) {
    let guard = ConnectionGuard::open(Arc::clone(&engine.counters));
    let (peer, local) = match (stream.peer_addr(), stream.local_addr()) {
        (Ok(peer), Ok(local)) => (peer, local),
        (Err(e), _) | (_, Err(e)) => {
            tracing::debug!(connection_id = %guard.id(), error = %e, "Connection gone before setup");
            return;
        }
    };

    let config = engine.config.load_full();
    let tls = engine.tls.load_full();
    let pipeline = PipelineBuilder::new(&config)
        .tls(tls.is_some())
        .upload(engine.upload.is_some())
        .websocket_paths(engine.websockets.keys().cloned())
        .build();
    let channel = ChannelInfo {
        id: guard.id(),
        peer,
        local,
        tls: tls.is_some(),
    };

    let span = tracing::debug_span!("connection", id = %channel.id, peer = %peer);
    async move {
        tracing::debug!(stages = ?pipeline.names(), "Pipeline assembled");
        match tls {
            Some(tls) => {
                let timeout = Duration::from_millis(config.socket.connect_timeout_ms);
                match tls.accept(stream, timeout).await {
                    Ok(stream) => serve_http(engine, pipeline, channel, stream).await,
                    Err(e) => tracing::warn!(error = %e, "TLS handshake rejected"),
                }
            }
            None => serve_http(engine, pipeline, channel, stream).await,
        }
        drop(permit);
        drop(guard);
    }
    .instrument(span)
    .await
}

async fn serve_http<S>(engine: Arc<Engine>, pipeline: Pipeline, channel: ChannelInfo, io: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let idle_close = CancellationToken::new();
    let idle_state = IdleState::new();
    let stream = IdleStream::new(io, Arc::clone(&idle_state));
    if pipeline.idle.is_enabled() {
        tokio::spawn(watch_idle(idle_state, pipeline.idle.clone(), idle_close.clone()));
    }

    let read_buffer_size = pipeline.read_buffer_size;
    let shutdown = engine.shutdown.clone();
    let handler = Arc::new(ConnectionHandler::new(engine, pipeline, channel));
    let service = service_fn(move |request| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(request).await }
    });

    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .keep_alive(true)
        .max_buf_size(read_buffer_size)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(error = %e, "Connection ended with error");
            }
        }
        _ = idle_close.cancelled() => {
            tracing::debug!("Connection closed by idle timer");
        }
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            if tokio::time::timeout(DRAIN_TIMEOUT, connection.as_mut()).await.is_err() {
                tracing::warn!("Connection did not drain before shutdown deadline");
            }
        }
    }
    idle_close.cancel();
}

/// Request-level stages of one connection.
struct ConnectionHandler {
    engine: Arc<Engine>,
    pipeline: Pipeline,
    channel: ChannelInfo,
    ping: PingHandler,
    close: CancellationToken,
}

impl ConnectionHandler {
    fn new(engine: Arc<Engine>, pipeline: Pipeline, channel: ChannelInfo) -> Self {
        let config = engine.config.load();
        let ping = PingHandler::new(
            Arc::new(config.ping.clone()),
            Arc::clone(&engine.health),
            Arc::clone(&engine.counters),
            Arc::clone(&engine.ping_lifecycle),
        );
        let close = engine.shutdown.child_token();
        Self {
            engine,
            pipeline,
            channel,
            ping,
            close,
        }
    }

    async fn handle(&self, request: Request<Incoming>) -> Result<Response<ResponseBody>, PipelineError> {
        let result = AssertUnwindSafe(self.run_stages(request)).catch_unwind().await;
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                match &e {
                    PipelineError::Send(_) => tracing::error!(error = %e, "Response send failed, closing connection"),
                    PipelineError::Body(_) => tracing::debug!(error = %e, "Closing connection"),
                    _ => tracing::warn!(error = %e, "Closing connection"),
                }
                Err(e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(connection_id = %self.channel.id, panic = %message, "Request handling panicked");
                Err(PipelineError::Panicked(message))
            }
        }
    }

    async fn run_stages(&self, request: Request<Incoming>) -> Result<Response<ResponseBody>, PipelineError> {
        // file upload | reject multipart
        if upload::is_multipart(request.headers()) {
            return match &self.engine.upload {
                Some(handler) if self.pipeline.has("file-upload") => {
                    let (parts, body) = request.into_parts();
                    Ok(handler.handle(self.channel, parts, body).await?)
                }
                _ => Err(PipelineError::MultipartRejected),
            };
        }

        // aggregator: refuse declared oversize bodies before reading them
        let limit = self.pipeline.max_content_length();
        let limit_u64 = u64::try_from(limit).unwrap_or(u64::MAX);
        if declared_length(request.headers()).is_some_and(|len| len > limit_u64) {
            return self.too_large(request.headers());
        }

        // websocket
        if self.pipeline.has("websocket") && websocket::is_upgrade_request(request.method(), request.headers()) {
            if let Some(handler) = self.engine.websockets.get(request.uri().path()) {
                let response = websocket::upgrade(request, self.channel, Arc::clone(handler), self.close.clone())
                    .map_err(|e| PipelineError::Send(e.into()))?;
                return Ok(response);
            }
        }

        // aggregator
        let (parts, body) = request.into_parts();
        let body: Bytes = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => return self.too_large(&parts.headers),
            Err(e) => return Err(PipelineError::Body(e)),
        };

        // ping
        if self.ping.matches(&parts.method, parts.uri.path()) {
            return self.ping.respond(parts.uri.path()).ok_or(PipelineError::PingVetoed);
        }

        // dispatch
        let settings = ResponseSettings {
            defaults: self.engine.defaults.load_full(),
            max_chunk_size: self.pipeline.max_chunk_size(),
        };
        Ok(self
            .engine
            .dispatcher
            .dispatch(self.channel, parts, body, &settings)
            .await?)
    }

    fn too_large(&self, headers: &HeaderMap) -> Result<Response<ResponseBody>, PipelineError> {
        tracing::warn!(
            connection_id = %self.channel.id,
            limit = self.pipeline.max_content_length(),
            "Request body exceeds max content length"
        );
        let mut response = response::error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            AppError::new(codes::PAYLOAD_TOO_LARGE, "Payload Too Large").with_tag("payload_too_large"),
            accepts_xml(headers),
            &transaction_id(headers),
            &self.engine.defaults.load(),
        )?;
        response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
        self.engine.counters.sent();
        Ok(response)
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IdleConfig, TlsConfig};

    #[test]
    fn minimal_pipeline_order() {
        let config = ServerConfig::default();
        let pipeline = PipelineBuilder::new(&config).build();
        assert_eq!(
            pipeline.names(),
            vec!["http-codec", "chunked-writer", "reject-multipart", "aggregator", "ping", "dispatch"]
        );
    }

    #[test]
    fn full_pipeline_order() {
        let config = ServerConfig {
            tls: Some(TlsConfig {
                cert_path: "cert.pem".into(),
                key_path: "key.pem".into(),
                trust_ca_path: None,
                protocols: vec!["TLSv1.3".into()],
                ciphers: vec![],
                verify_hostname: true,
                server_names: vec!["example.com".into()],
            }),
            idle: IdleConfig {
                reader_idle_secs: 30,
                writer_idle_secs: 10,
                heartbeat_payload: "\r\n".into(),
            },
            ..ServerConfig::default()
        };
        let pipeline = PipelineBuilder::new(&config)
            .tls(true)
            .upload(true)
            .websocket_paths(["/ws".to_string()])
            .build();
        assert_eq!(
            pipeline.names(),
            vec![
                "tls",
                "reader-idle",
                "writer-idle",
                "http-codec",
                "chunked-writer",
                "file-upload",
                "aggregator",
                "websocket",
                "ping",
                "dispatch"
            ]
        );
        assert_eq!(pipeline.stages()[0], Stage::Tls { verify_hostname: true });
        assert!(pipeline.idle.is_enabled());
    }

    #[test]
    fn declared_length_parses_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_length(&headers), None);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1024"));
        assert_eq!(declared_length(&headers), Some(1024));
    }
}
