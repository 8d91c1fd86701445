//! Per-request response context.
//!
//! A `ResponseContext` is created when a request is decoded, moved into the
//! worker task, moved back to the I/O task for the write, and consumed by the
//! request logger. It is never shared: exactly one thread owns it at a time.
//!
//! # Contents
//! - Immutable request facts (`Arc<RequestFacts>`)
//! - Response status, headers, and one payload (text, file or redirect)
//! - Error list, POI timeline, memo lines
//! - Caller identity and per-request logging toggles

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use http::StatusCode;
use serde::Serialize;

use crate::http::request::RequestFacts;
use crate::service::AppError;

/// Built-in POI marker names.
pub mod poi {
    pub const BEGIN: &str = "begin";
    pub const QUEUED: &str = "queued";
    pub const PROCESS_BEGIN: &str = "process.begin";
    pub const PROCESS_END: &str = "process.end";
    pub const RESPONDED: &str = "responded";
    pub const END: &str = "end";
}

/// A named point in time during processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poi {
    pub name: String,
    pub at: Instant,
}

/// A free-form note attached to the request record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memo {
    pub id: String,
    pub desc: String,
}

/// Authenticated caller, set by the authenticator hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub id: i64,
    pub name: String,
    pub groups: Vec<String>,
    pub roles: Vec<String>,
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.id)?;
        if !self.groups.is_empty() {
            write!(f, " groups={:?}", self.groups)?;
        }
        if !self.roles.is_empty() {
            write!(f, " roles={:?}", self.roles)?;
        }
        Ok(())
    }
}

/// What the response carries. One variant at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    File {
        path: PathBuf,
        /// Offered as `Content-Disposition: attachment` when set.
        download_name: Option<String>,
    },
    Redirect(String),
}

/// Which parts of the request/response may appear in the verbose dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogToggles {
    pub request_header: bool,
    pub request_body: bool,
    pub response_header: bool,
    pub response_body: bool,
}

impl Default for LogToggles {
    fn default() -> Self {
        Self {
            request_header: true,
            request_body: true,
            response_header: true,
            response_body: true,
        }
    }
}

/// Phase durations derived from the POI timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    /// Time spent waiting in the worker queue.
    pub queuing: Duration,
    /// Time spent in the business callback.
    pub processing: Duration,
    /// Decode to last marker.
    pub response: Duration,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    errors: &'a [AppError],
}

/// Mutable response state of one request.
#[derive(Debug)]
pub struct ResponseContext {
    tx_id: String,
    hit: u64,
    request: Arc<RequestFacts>,
    started_at: SystemTime,
    status: StatusCode,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    payload: Payload,
    errors: Vec<AppError>,
    pois: Vec<Poi>,
    memos: Vec<Memo>,
    caller: Option<Caller>,
    log: LogToggles,
    sent_body: Option<String>,
}

impl ResponseContext {
    pub fn new(tx_id: impl Into<String>, hit: u64, request: Arc<RequestFacts>, log: LogToggles) -> Self {
        let mut ctx = Self {
            tx_id: tx_id.into(),
            hit,
            request,
            started_at: SystemTime::now(),
            status: StatusCode::OK,
            headers: Vec::new(),
            content_type: None,
            payload: Payload::Empty,
            errors: Vec::new(),
            pois: Vec::with_capacity(8),
            memos: Vec::new(),
            caller: None,
            log,
            sent_body: None,
        };
        ctx.poi(poi::BEGIN);
        ctx
    }

    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    /// Running hit number assigned at decode time.
    pub fn hit(&self) -> u64 {
        self.hit
    }

    pub fn request(&self) -> &RequestFacts {
        &self.request
    }

    pub(crate) fn request_arc(&self) -> Arc<RequestFacts> {
        Arc::clone(&self.request)
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    // --- status & headers ---

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// Append a response header. Validated when the response is written.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace every value of a response header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.content_type = Some(content_type.into());
        self
    }

    // --- payload ---

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn take_payload(&mut self) -> Payload {
        std::mem::take(&mut self.payload)
    }

    /// Respond with a text body. Replaces any file or redirect.
    pub fn set_text(&mut self, body: impl Into<String>) -> &mut Self {
        self.payload = Payload::Text(body.into());
        self
    }

    /// Respond with a file streamed in chunks. Replaces any text or redirect.
    pub fn set_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.payload = Payload::File {
            path: path.into(),
            download_name: None,
        };
        self
    }

    /// Respond with a file offered as a download under `name`.
    pub fn set_download(&mut self, path: impl Into<PathBuf>, name: impl Into<String>) -> &mut Self {
        self.payload = Payload::File {
            path: path.into(),
            download_name: Some(name.into()),
        };
        self
    }

    /// Redirect to `location`. Replaces any text or file.
    pub fn set_redirect(&mut self, location: impl Into<String>) -> &mut Self {
        self.payload = Payload::Redirect(location.into());
        self
    }

    /// Body text that was actually written, including synthesized error bodies.
    pub fn sent_body(&self) -> Option<&str> {
        self.sent_body.as_deref()
    }

    pub(crate) fn record_sent_body(&mut self, body: String) {
        self.sent_body = Some(body);
    }

    // --- errors ---

    pub fn add_error(&mut self, error: AppError) -> &mut Self {
        self.errors.push(error);
        self
    }

    /// Set the status and append an error in one step.
    pub fn fail(&mut self, status: StatusCode, error: AppError) -> &mut Self {
        self.status = status;
        self.errors.push(error);
        self
    }

    pub fn errors(&self) -> &[AppError] {
        &self.errors
    }

    /// Error body synthesized from the error list: XML when the client
    /// accepts XML, JSON otherwise.
    pub fn error_body(&self) -> (String, &'static str) {
        render_errors(&self.errors, self.accepts_xml())
    }

    pub fn accepts_xml(&self) -> bool {
        accepts_xml(&self.request.headers)
    }

    // --- timeline ---

    /// Stamp a POI. Timestamps never go backwards within one context.
    pub fn poi(&mut self, name: impl Into<String>) -> &mut Self {
        let now = Instant::now();
        let at = match self.pois.last() {
            Some(last) if last.at > now => last.at,
            _ => now,
        };
        self.pois.push(Poi { name: name.into(), at });
        self
    }

    pub fn pois(&self) -> &[Poi] {
        &self.pois
    }

    /// Last instant recorded under `name`.
    pub fn poi_at(&self, name: &str) -> Option<Instant> {
        self.pois.iter().rev().find(|p| p.name == name).map(|p| p.at)
    }

    /// Duration between two markers, zero if either is missing.
    pub fn between(&self, from: &str, to: &str) -> Duration {
        match (self.poi_at(from), self.poi_at(to)) {
            (Some(a), Some(b)) => b.saturating_duration_since(a),
            _ => Duration::ZERO,
        }
    }

    pub fn timings(&self) -> Timings {
        let response = match (self.pois.first(), self.pois.last()) {
            (Some(first), Some(last)) => last.at.saturating_duration_since(first.at),
            _ => Duration::ZERO,
        };
        Timings {
            queuing: self.between(poi::QUEUED, poi::PROCESS_BEGIN),
            processing: self.between(poi::PROCESS_BEGIN, poi::PROCESS_END),
            response,
        }
    }

    // --- memo, caller, logging ---

    pub fn memo(&mut self, id: impl Into<String>, desc: impl Into<String>) -> &mut Self {
        self.memos.push(Memo {
            id: id.into(),
            desc: desc.into(),
        });
        self
    }

    pub fn memos(&self) -> &[Memo] {
        &self.memos
    }

    pub fn set_caller(&mut self, caller: Caller) -> &mut Self {
        self.caller = Some(caller);
        self
    }

    pub fn caller(&self) -> Option<&Caller> {
        self.caller.as_ref()
    }

    pub fn log_toggles(&self) -> LogToggles {
        self.log
    }

    /// Business code may hide sensitive parts of this request from the log.
    pub fn log_toggles_mut(&mut self) -> &mut LogToggles {
        &mut self.log
    }
}

/// Whether any `Accept` value mentions XML.
pub fn accepts_xml(headers: &http::HeaderMap) -> bool {
    headers
        .get_all(http::header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("xml"))
}

/// Serialize an error list as XML or JSON, with the matching content type.
pub fn render_errors(errors: &[AppError], xml: bool) -> (String, &'static str) {
    if xml {
        (errors_to_xml(errors), "application/xml; charset=utf-8")
    } else {
        let json = serde_json::to_string(&ErrorBody { errors }).unwrap_or_else(|_| "{\"errors\":[]}".to_string());
        (json, "application/json; charset=utf-8")
    }
}

fn errors_to_xml(errors: &[AppError]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><errors>");
    for e in errors {
        out.push_str("<error><code>");
        out.push_str(&e.code.to_string());
        out.push_str("</code>");
        if let Some(tag) = &e.tag {
            out.push_str("<tag>");
            out.push_str(&xml_escape(tag));
            out.push_str("</tag>");
        }
        out.push_str("<message>");
        out.push_str(&xml_escape(&e.message));
        out.push_str("</message></error>");
    }
    out.push_str("</errors>");
    out
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::connection::{ChannelInfo, ConnectionId};
    use bytes::Bytes;
    use http::Method;

    pub(crate) fn context_for(method: Method, uri: &str, accept: Option<&str>) -> ResponseContext {
        let mut builder = http::Request::builder().method(method).uri(uri);
        if let Some(accept) = accept {
            builder = builder.header("accept", accept);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        let channel = ChannelInfo {
            id: ConnectionId::new(),
            peer: "127.0.0.1:4000".parse().unwrap(),
            local: "127.0.0.1:8080".parse().unwrap(),
            tls: false,
        };
        let facts = RequestFacts::decode(channel, parts, Bytes::new()).unwrap();
        ResponseContext::new("tx-test", 1, Arc::new(facts), LogToggles::default())
    }

    #[test]
    fn payload_variants_are_exclusive() {
        let mut ctx = context_for(Method::GET, "/", None);
        ctx.set_text("hello");
        ctx.set_redirect("/elsewhere");
        assert_eq!(ctx.payload(), &Payload::Redirect("/elsewhere".into()));
        ctx.set_file("/tmp/report.csv");
        assert!(matches!(ctx.payload(), Payload::File { download_name: None, .. }));
        ctx.set_text("back to text");
        assert_eq!(ctx.payload(), &Payload::Text("back to text".into()));
    }

    #[test]
    fn poi_timeline_is_non_empty_and_ordered() {
        let mut ctx = context_for(Method::GET, "/", None);
        assert_eq!(ctx.pois()[0].name, poi::BEGIN);
        for name in [poi::QUEUED, poi::PROCESS_BEGIN, "db.query", poi::PROCESS_END, poi::END] {
            ctx.poi(name);
        }
        assert!(ctx.pois().windows(2).all(|w| w[0].at <= w[1].at));
        let t = ctx.timings();
        assert!(t.response >= t.processing);
        assert_eq!(ctx.between("missing", poi::END), Duration::ZERO);
    }

    #[test]
    fn error_body_json_by_default() {
        let mut ctx = context_for(Method::GET, "/", Some("application/json"));
        ctx.fail(StatusCode::NOT_FOUND, AppError::new(404, "no such user").with_tag("user"));
        let (body, content_type) = ctx.error_body();
        assert_eq!(body, r#"{"errors":[{"code":404,"tag":"user","message":"no such user"}]}"#);
        assert!(content_type.starts_with("application/json"));
    }

    #[test]
    fn error_body_xml_when_accepted() {
        let mut ctx = context_for(Method::GET, "/", Some("text/html, application/XML;q=0.9"));
        ctx.fail(StatusCode::BAD_REQUEST, AppError::new(7, "a < b"));
        let (body, content_type) = ctx.error_body();
        assert!(body.contains("<error><code>7</code><message>a &lt; b</message></error>"), "{body}");
        assert!(content_type.starts_with("application/xml"));
    }

    #[test]
    fn errors_do_not_set_status() {
        let mut ctx = context_for(Method::GET, "/", None);
        ctx.add_error(AppError::new(1, "warning only"));
        assert_eq!(ctx.status(), StatusCode::OK);
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut ctx = context_for(Method::GET, "/", None);
        ctx.add_header("X-Trace", "a").add_header("x-other", "b");
        ctx.set_header("x-trace", "c");
        assert_eq!(
            ctx.headers(),
            &[("x-other".to_string(), "b".to_string()), ("x-trace".to_string(), "c".to_string())]
        );
    }
}
