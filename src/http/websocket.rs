//! WebSocket upgrade handling.
//!
//! # Responsibilities
//! - Detect WebSocket upgrade requests on registered paths
//! - Complete the upgrade handshake with the client
//! - Feed incoming messages to the path's handler and send its replies
//!
//! # Design Decisions
//! - The handshake response is written by the HTTP codec; the socket is
//!   taken over only after hyper hands out the upgraded stream
//! - Ping/pong handled transparently by tungstenite
//! - Sessions end on close frames, errors, or connection shutdown

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::http::response::{empty, ResponseBody};
use crate::net::ChannelInfo;

/// Per-path WebSocket session logic.
pub trait WebSocketHandler: Send + Sync + 'static {
    fn on_open(&self, _channel: &ChannelInfo) {}

    /// Handle one data message; a returned message is sent back.
    fn on_message(&self, channel: &ChannelInfo, message: Message) -> Option<Message>;

    fn on_close(&self, _channel: &ChannelInfo) {}
}

/// Whether the request asks for a version 13 WebSocket upgrade.
pub fn is_upgrade_request(method: &Method, headers: &HeaderMap) -> bool {
    let has_token = |name: http::header::HeaderName, token: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    };
    method == Method::GET
        && has_token(UPGRADE, "websocket")
        && has_token(CONNECTION, "upgrade")
        && headers.get(SEC_WEBSOCKET_VERSION).is_some_and(|v| v == "13")
        && headers.contains_key(SEC_WEBSOCKET_KEY)
}

/// Answer the handshake and spawn the session once the connection upgrades.
pub fn upgrade(
    mut request: Request<Incoming>,
    channel: ChannelInfo,
    handler: Arc<dyn WebSocketHandler>,
    shutdown: CancellationToken,
) -> Result<Response<ResponseBody>, http::Error> {
    let accept = request
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
        .unwrap_or_default();
    let on_upgrade = hyper::upgrade::on(&mut request);
    let path = request.uri().path().to_string();

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(connection_id = %channel.id, path = %path, error = %e, "WebSocket upgrade failed");
                return;
            }
        };
        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        tracing::debug!(connection_id = %channel.id, path = %path, "WebSocket session opened");
        handler.on_open(&channel);
        run_session(ws, &channel, handler.as_ref(), shutdown).await;
        handler.on_close(&channel);
        tracing::debug!(connection_id = %channel.id, path = %path, "WebSocket session closed");
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(empty())
}

async fn run_session<S>(
    ws: WebSocketStream<S>,
    channel: &ChannelInfo,
    handler: &dyn WebSocketHandler,
    shutdown: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                if let Some(reply) = handler.on_message(channel, message) {
                    if let Err(e) = sink.send(reply).await {
                        tracing::debug!(connection_id = %channel.id, error = %e, "WebSocket send failed");
                        break;
                    }
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(connection_id = %channel.id, error = %e, "WebSocket receive failed");
                break;
            }
        }
    }
}
