//! Response rendering.
//!
//! # Responsibilities
//! - Turn a finished `ResponseContext` into an HTTP response
//! - Add default headers, `Server` and `X-Request-Id`
//! - Stream files in bounded chunks with progress tracking
//! - Synthesize an error body for failures without an explicit text body
//!
//! # Design Decisions
//! - Exactly one payload path runs: text, file or redirect
//! - Headers set by business code replace defaults of the same name
//! - File bodies carry no length hint so HTTP/1.1 sends them chunked

use std::collections::HashSet;
use std::path::Path;

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Response, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tokio_util::io::ReaderStream;

use crate::config::{ResponseConfig, ValidationError};
use crate::http::context::{render_errors, Payload, ResponseContext};
use crate::http::request::X_REQUEST_ID;
use crate::service::{codes, AppError};

/// Body type of every response the engine writes.
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

pub fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// The response could not be put on the wire.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("invalid response header name {0:?}")]
    HeaderName(String),
    #[error("invalid value for response header {0}")]
    HeaderValue(String),
    #[error("failed to build response: {0}")]
    Http(#[from] http::Error),
}

/// Headers stamped on every response. Swapped as a whole on reload.
#[derive(Debug, Clone, Default)]
pub struct ResponseDefaults {
    headers: HeaderMap,
    server: Option<HeaderValue>,
}

impl ResponseDefaults {
    pub fn from_config(config: &ResponseConfig) -> Result<Self, ValidationError> {
        let invalid = |name: &str, message: String| ValidationError {
            field: format!("response.default_headers.{name}"),
            message,
        };
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(name, e.to_string()))?;
            let header_value = HeaderValue::from_str(value).map_err(|e| invalid(name, e.to_string()))?;
            headers.insert(header_name, header_value);
        }
        let server = if config.server_name.is_empty() {
            None
        } else {
            Some(HeaderValue::from_str(&config.server_name).map_err(|e| ValidationError {
                field: "response.server_name".into(),
                message: e.to_string(),
            })?)
        };
        Ok(Self { headers, server })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Render the response for `ctx`. The payload is taken out of the context;
/// the body text actually sent is recorded back for the request log.
pub async fn render(
    ctx: &mut ResponseContext,
    defaults: &ResponseDefaults,
    max_chunk_size: usize,
) -> Result<Response<ResponseBody>, SendError> {
    let mut extra: Vec<(HeaderName, HeaderValue)> = Vec::new();

    let (body, content_type) = match ctx.take_payload() {
        Payload::Text(text) => {
            let content_type = ctx
                .content_type()
                .unwrap_or("text/plain; charset=utf-8")
                .to_string();
            ctx.record_sent_body(text.clone());
            (full(text), Some(content_type))
        }
        Payload::Redirect(location) => {
            if !ctx.status().is_redirection() {
                ctx.set_status(StatusCode::FOUND);
            }
            let value = HeaderValue::from_str(&location).map_err(|_| SendError::HeaderValue("location".into()))?;
            extra.push((header::LOCATION, value));
            (empty(), None)
        }
        Payload::File { path, download_name } => match open_file(ctx, &path, max_chunk_size).await {
            Some(body) => {
                if let Some(name) = download_name {
                    let disposition = format!("attachment; filename=\"{}\"", name.replace('"', ""));
                    let value = HeaderValue::from_str(&disposition)
                        .map_err(|_| SendError::HeaderValue("content-disposition".into()))?;
                    extra.push((header::CONTENT_DISPOSITION, value));
                }
                let content_type = ctx
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                (body, Some(content_type))
            }
            None => error_payload(ctx),
        },
        Payload::Empty if ctx.status().as_u16() >= 400 => error_payload(ctx),
        Payload::Empty => (empty(), ctx.content_type().map(str::to_string)),
    };

    let mut builder = Response::builder().status(ctx.status());
    let headers = builder.headers_mut().ok_or_else(|| SendError::HeaderName("<builder>".into()))?;
    apply_headers(headers, ctx, defaults, extra, content_type)?;
    Ok(builder.body(body)?)
}

/// Error response for failures raised before a context exists.
pub fn error_response(
    status: StatusCode,
    error: AppError,
    xml: bool,
    tx_id: &str,
    defaults: &ResponseDefaults,
) -> Result<Response<ResponseBody>, SendError> {
    let (text, content_type) = render_errors(std::slice::from_ref(&error), xml);
    let tx_id = HeaderValue::from_str(tx_id).map_err(|_| SendError::HeaderValue(X_REQUEST_ID.into()))?;
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(X_REQUEST_ID, tx_id);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(defaults.headers.clone());
        if let Some(server) = &defaults.server {
            headers.insert(header::SERVER, server.clone());
        }
    }
    Ok(builder.body(full(text))?)
}

fn error_payload(ctx: &mut ResponseContext) -> (ResponseBody, Option<String>) {
    let (text, content_type) = ctx.error_body();
    ctx.record_sent_body(text.clone());
    (full(text), Some(content_type.to_string()))
}

fn apply_headers(
    headers: &mut HeaderMap,
    ctx: &ResponseContext,
    defaults: &ResponseDefaults,
    extra: Vec<(HeaderName, HeaderValue)>,
    content_type: Option<String>,
) -> Result<(), SendError> {
    headers.extend(defaults.headers.clone());
    if let Some(server) = &defaults.server {
        headers.insert(header::SERVER, server.clone());
    }

    let mut overridden = HashSet::new();
    for (name, value) in ctx.headers() {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| SendError::HeaderName(name.clone()))?;
        let value = HeaderValue::from_str(value).map_err(|_| SendError::HeaderValue(name.to_string()))?;
        if overridden.insert(name.clone()) {
            headers.remove(&name);
        }
        headers.append(name, value);
    }

    for (name, value) in extra {
        headers.insert(name, value);
    }
    if let Some(content_type) = content_type {
        let value = HeaderValue::from_str(&content_type).map_err(|_| SendError::HeaderValue("content-type".into()))?;
        headers.insert(header::CONTENT_TYPE, value);
    }
    let tx_id = HeaderValue::from_str(ctx.tx_id()).map_err(|_| SendError::HeaderValue(X_REQUEST_ID.into()))?;
    headers.insert(X_REQUEST_ID, tx_id);
    Ok(())
}

/// Open the file and wrap it in a chunked stream. On failure the context is
/// marked with the matching error and `None` is returned.
async fn open_file(ctx: &mut ResponseContext, path: &Path, max_chunk_size: usize) -> Option<ResponseBody> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            let (status, code) = if e.kind() == std::io::ErrorKind::NotFound {
                (StatusCode::NOT_FOUND, codes::FILE_NOT_FOUND)
            } else {
                (StatusCode::INTERNAL_SERVER_ERROR, codes::IO_ERROR)
            };
            tracing::warn!(tx_id = %ctx.tx_id(), path = %path.display(), error = %e, "Cannot open response file");
            ctx.fail(
                status,
                AppError::new(code, status.canonical_reason().unwrap_or("Error"))
                    .with_tag("file")
                    .with_cause(e.to_string()),
            );
            return None;
        }
    };
    let total = file.metadata().await.map(|m| m.len()).ok();
    ctx.record_sent_body(format!("<file {} ({} bytes)>", path.display(), total.unwrap_or(0)));

    let tx_id = ctx.tx_id().to_string();
    let mut sent: u64 = 0;
    let stream = ReaderStream::with_capacity(file, max_chunk_size.max(1)).map(move |chunk: std::io::Result<Bytes>| -> std::io::Result<Frame<Bytes>> {
        let chunk = chunk?;
        sent += chunk.len() as u64;
        tracing::trace!(tx_id = %tx_id, sent, total = ?total, "File chunk written");
        if Some(sent) == total {
            tracing::debug!(tx_id = %tx_id, bytes = sent, "File transfer complete");
        }
        Ok(Frame::data(chunk))
    });
    Some(StreamBody::new(stream).boxed_unsync())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::context::tests::context_for;
    use http::Method;
    use std::collections::BTreeMap;
    use std::io::Write;

    async fn body_text(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn defaults() -> ResponseDefaults {
        let mut default_headers = BTreeMap::new();
        default_headers.insert("cache-control".to_string(), "no-store".to_string());
        default_headers.insert("x-frame-options".to_string(), "DENY".to_string());
        ResponseDefaults::from_config(&ResponseConfig {
            default_headers,
            server_name: "engine-test".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn text_with_defaults_and_overrides() {
        let mut ctx = context_for(Method::GET, "/", None);
        ctx.set_text("hello").add_header("Cache-Control", "max-age=60");
        let response = render(&mut ctx, &defaults(), 8192).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let h = response.headers();
        assert_eq!(h[header::CACHE_CONTROL], "max-age=60");
        assert_eq!(h["x-frame-options"], "DENY");
        assert_eq!(h[header::SERVER], "engine-test");
        assert_eq!(h[X_REQUEST_ID], "tx-test");
        assert!(h[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/plain"));
        assert_eq!(body_text(response).await, "hello");
        assert_eq!(ctx.sent_body(), Some("hello"));
    }

    #[tokio::test]
    async fn failure_without_text_gets_error_body() {
        let mut ctx = context_for(Method::GET, "/", Some("application/xml"));
        ctx.fail(StatusCode::CONFLICT, AppError::new(9, "exists"));
        let response = render(&mut ctx, &ResponseDefaults::default(), 8192).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_text(response).await.contains("<code>9</code>"));
    }

    #[tokio::test]
    async fn explicit_text_wins_over_error_body() {
        let mut ctx = context_for(Method::GET, "/", None);
        ctx.fail(StatusCode::BAD_REQUEST, AppError::new(1, "bad"))
            .set_text("custom");
        let response = render(&mut ctx, &ResponseDefaults::default(), 8192).await.unwrap();
        assert_eq!(body_text(response).await, "custom");
    }

    #[tokio::test]
    async fn redirect_defaults_to_found() {
        let mut ctx = context_for(Method::GET, "/old", None);
        ctx.set_redirect("/new");
        let response = render(&mut ctx, &ResponseDefaults::default(), 8192).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/new");

        let mut ctx = context_for(Method::GET, "/old", None);
        ctx.set_status(StatusCode::MOVED_PERMANENTLY).set_redirect("/new");
        let response = render(&mut ctx, &ResponseDefaults::default(), 8192).await.unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[tokio::test]
    async fn file_is_streamed_in_chunks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content = "0123456789".repeat(100);
        file.write_all(content.as_bytes()).unwrap();

        let mut ctx = context_for(Method::GET, "/report", None);
        ctx.set_download(file.path(), "report.txt");
        let response = render(&mut ctx, &ResponseDefaults::default(), 64).await.unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"report.txt\""
        );
        assert_eq!(body_text(response).await, content);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_for(Method::GET, "/report", None);
        ctx.set_file(dir.path().join("gone.csv"));
        let response = render(&mut ctx, &ResponseDefaults::default(), 64).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(ctx.errors()[0].code, codes::FILE_NOT_FOUND);
    }

    #[tokio::test]
    async fn standalone_error_response() {
        let response = error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            AppError::new(codes::PAYLOAD_TOO_LARGE, "Payload Too Large"),
            false,
            "tx-413",
            &defaults(),
        )
        .unwrap();
        assert_eq!(response.headers()[header::SERVER], "engine-test");
        assert_eq!(response.headers()[X_REQUEST_ID], "tx-413");
        assert_eq!(
            body_text(response).await,
            r#"{"errors":[{"code":1010,"message":"Payload Too Large"}]}"#
        );
    }

    #[test]
    fn invalid_default_header_is_rejected() {
        let mut default_headers = BTreeMap::new();
        default_headers.insert("bad header".to_string(), "x".to_string());
        let err = ResponseDefaults::from_config(&ResponseConfig {
            default_headers,
            server_name: String::new(),
        })
        .unwrap_err();
        assert_eq!(err.field, "response.default_headers.bad header");
    }
}
