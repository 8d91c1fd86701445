//! Request decoding.
//!
//! # Responsibilities
//! - Turn an aggregated request into owned, immutable `RequestFacts`
//! - Percent-decode the path and query parameters
//! - Materialize the body as a string for mutating methods only
//!
//! # Design Decisions
//! - Decoding happens on the I/O task, before any hand-off to the worker pool
//! - Anything that cannot be decoded is a `MalformedRequest` (400), never queued
//! - The network buffer is consumed by value; nothing retains it after decode

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, Method, Uri, Version};
use percent_encoding::percent_decode_str;

use crate::net::connection::ChannelInfo;

/// Request header carrying the client-supplied request id.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Why a request could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedRequest {
    #[error("invalid percent-encoding in path")]
    PathEncoding,
    #[error("path is not valid UTF-8")]
    PathUtf8,
    #[error("invalid percent-encoding in query string")]
    QueryEncoding,
    #[error("request body is not valid UTF-8")]
    BodyUtf8,
}

/// Everything the business callback knows about a request.
#[derive(Debug, Clone)]
pub struct RequestFacts {
    pub channel: ChannelInfo,
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    /// Percent-decoded path.
    pub path: String,
    /// Decoded query parameters in arrival order.
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    /// Body text, present only for mutating methods.
    pub body: Option<String>,
}

impl RequestFacts {
    /// Decode request head and aggregated body.
    pub fn decode(channel: ChannelInfo, parts: Parts, body: Bytes) -> Result<Self, MalformedRequest> {
        let raw_path = parts.uri.path();
        if !escapes_are_valid(raw_path) {
            return Err(MalformedRequest::PathEncoding);
        }
        let path = percent_decode_str(raw_path)
            .decode_utf8()
            .map_err(|_| MalformedRequest::PathUtf8)?
            .into_owned();

        let query = match parts.uri.query() {
            Some(raw) => {
                if !escapes_are_valid(raw) {
                    return Err(MalformedRequest::QueryEncoding);
                }
                url::form_urlencoded::parse(raw.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            }
            None => Vec::new(),
        };

        let body = if is_mutating(&parts.method) {
            // Vec::from(Bytes) reuses the allocation when uniquely owned
            let text = String::from_utf8(Vec::from(body)).map_err(|_| MalformedRequest::BodyUtf8)?;
            Some(text)
        } else {
            drop(body);
            None
        };

        Ok(Self {
            channel,
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            path,
            query,
            headers: parts.headers,
            body,
        })
    }

    /// First value of a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a query parameter.
    pub fn params<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.query
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// A header value as text, if present and visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Methods whose body is handed to the business callback.
pub fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// Every `%` must start a two-digit hex escape.
fn escapes_are_valid(input: &str) -> bool {
    let bytes = input.as_bytes();
    bytes.iter().enumerate().all(|(i, &b)| {
        b != b'%'
            || matches!(
                (bytes.get(i + 1), bytes.get(i + 2)),
                (Some(hi), Some(lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit()
            )
    })
}
