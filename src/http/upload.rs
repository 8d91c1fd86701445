//! Streamed multipart upload interception.
//!
//! Multipart requests are intercepted before aggregation. With a registered
//! [`UploadHandler`] the request body is handed over unbuffered; without one
//! the connection is closed so uploads fail fast instead of filling memory.

use futures_util::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::request::Parts;
use http::{HeaderMap, Response};
use hyper::body::Incoming;

use crate::http::response::ResponseBody;
use crate::net::ChannelInfo;

/// Upload failure. The connection is closed without a response.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("upload body failed: {0}")]
    Body(#[from] hyper::Error),
    #[error("upload storage failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Consumes a multipart request body as it arrives.
pub trait UploadHandler: Send + Sync + 'static {
    fn handle(
        &self,
        channel: ChannelInfo,
        parts: Parts,
        body: Incoming,
    ) -> BoxFuture<'static, Result<Response<ResponseBody>, UploadError>>;
}

/// Whether the request declares a multipart body.
pub fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("multipart/"))
}
