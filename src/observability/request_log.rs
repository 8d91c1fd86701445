//! Per-request log record.
//!
//! One multi-line record is emitted per completed request on the
//! `request_engine::access` target:
//!
//! ```text
//! [tx] caller: alice#7 roles=["admin"]
//! [tx] GET /orders?id=3 HTTP/1.1 -> 500 errors=1 queuing=0.041ms processing=2.310ms response=2.502ms OVERTIME
//! [tx] poi: begin=0.000ms queued=0.012ms process.begin=0.053ms ...
//! [tx] > accept: application/json
//! [tx] < {"errors":[...]}
//! [tx] memo db: 3 rows
//! ```
//!
//! # Verbose filtering
//! The header/body dump is gated twice: first by caller identity, then by
//! response code. Both stages must pass.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::{CallerFilter, PoiFilter, RecordLevel, RequestLogConfig, ResponseCodeFilter};
use crate::http::context::{Caller, ResponseContext};

/// Target of every request record.
pub const ACCESS_TARGET: &str = "request_engine::access";

/// A rendered record, ready to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub level: RecordLevel,
    pub overtime: bool,
    pub verbose: bool,
    pub text: String,
}

/// Renders and emits request records. The configuration is hot-swappable.
#[derive(Debug)]
pub struct RequestLogger {
    config: ArcSwap<RequestLogConfig>,
}

impl RequestLogger {
    pub fn new(config: RequestLogConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
        }
    }

    pub fn config(&self) -> Arc<RequestLogConfig> {
        self.config.load_full()
    }

    pub fn reload(&self, config: RequestLogConfig) {
        self.config.store(Arc::new(config));
    }

    /// Render and emit the record for a finished request. Nothing is
    /// rendered when the subscriber would discard the record.
    pub fn log(&self, ctx: &ResponseContext) {
        let config = self.config.load();
        let Some((level, overtime)) = classify(&config, ctx) else {
            return;
        };
        if !access_enabled(level) {
            return;
        }
        let record = build(&config, ctx, level, overtime);
        emit(&record, ctx.tx_id());
    }

    /// Render the record, or `None` when request logging is off.
    pub fn render(&self, ctx: &ResponseContext) -> Option<RequestRecord> {
        let config = self.config.load();
        let (level, overtime) = classify(&config, ctx)?;
        Some(build(&config, ctx, level, overtime))
    }
}

/// Record level after OVERTIME escalation, or `None` when logging is off.
fn classify(config: &RequestLogConfig, ctx: &ResponseContext) -> Option<(RecordLevel, bool)> {
    if config.level == RecordLevel::Off {
        return None;
    }
    let overtime = ctx.timings().response > Duration::from_millis(config.overtime_threshold_ms);
    let level = if overtime {
        config.level.max(RecordLevel::Warn)
    } else {
        config.level
    };
    Some((level, overtime))
}

fn build(config: &RequestLogConfig, ctx: &ResponseContext, level: RecordLevel, overtime: bool) -> RequestRecord {
    let timings = ctx.timings();
    let verbose = caller_passes(&config.verbose.caller, ctx.caller()) && code_passes(&config.verbose.response_code, ctx);

    let tx = ctx.tx_id();
    let request = ctx.request();
    let mut text = String::with_capacity(512);

    match ctx.caller() {
        Some(caller) => {
            let _ = writeln!(text, "[{tx}] caller: {caller}");
        }
        None => {
            let _ = writeln!(text, "[{tx}] caller: anonymous");
        }
    }

    let _ = write!(
        text,
        "[{tx}] {} {} {:?} -> {} errors={} queuing={} processing={} response={}",
        request.method,
        request.uri,
        request.version,
        ctx.status().as_u16(),
        ctx.errors().len(),
        millis(timings.queuing),
        millis(timings.processing),
        millis(timings.response),
    );
    if overtime {
        text.push_str(" OVERTIME");
    }
    text.push('\n');

    let origin = ctx.pois().first().map(|p| p.at);
    let pois: Vec<String> = ctx
        .pois()
        .iter()
        .filter(|p| match &config.poi {
            PoiFilter::All => true,
            PoiFilter::Only { names } => names.iter().any(|n| n == &p.name),
            PoiFilter::None => false,
        })
        .map(|p| {
            let since = origin.map(|o| p.at.saturating_duration_since(o)).unwrap_or_default();
            format!("{}={}", p.name, millis(since))
        })
        .collect();
    if !pois.is_empty() {
        let _ = writeln!(text, "[{tx}] poi: {}", pois.join(" "));
    }

    for e in ctx.errors() {
        let _ = writeln!(text, "[{tx}] error {}: {}", e.code, e.message);
    }

    if verbose {
        let toggles = ctx.log_toggles();
        if toggles.request_header {
            for (name, value) in &request.headers {
                let _ = writeln!(text, "[{tx}] > {}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
        }
        if toggles.request_body {
            if let Some(body) = request.body.as_deref().filter(|b| !b.is_empty()) {
                let _ = writeln!(text, "[{tx}] > {body}");
            }
        }
        if toggles.response_header {
            if let Some(content_type) = ctx.content_type() {
                let _ = writeln!(text, "[{tx}] < content-type: {content_type}");
            }
            for (name, value) in ctx.headers() {
                let _ = writeln!(text, "[{tx}] < {name}: {value}");
            }
        }
        if toggles.response_body {
            if let Some(body) = ctx.sent_body().filter(|b| !b.is_empty()) {
                let _ = writeln!(text, "[{tx}] < {body}");
            }
        }
    }

    for memo in ctx.memos() {
        let _ = writeln!(text, "[{tx}] memo {}: {}", memo.id, memo.desc);
    }

    if text.ends_with('\n') {
        text.pop();
    }

    RequestRecord {
        level,
        overtime,
        verbose,
        text,
    }
}

fn millis(d: Duration) -> String {
    format!("{:.3}ms", d.as_secs_f64() * 1_000.0)
}

/// First stage: who called.
pub fn caller_passes(filter: &CallerFilter, caller: Option<&Caller>) -> bool {
    let overlaps = |wanted: &[String], have: &[String]| wanted.iter().any(|w| have.contains(w));
    match (filter, caller) {
        (CallerFilter::Any, _) => true,
        (_, None) => false,
        (CallerFilter::Ids { ids }, Some(c)) => ids.contains(&c.id),
        (CallerFilter::Names { names }, Some(c)) => names.contains(&c.name),
        (CallerFilter::Groups { groups }, Some(c)) => overlaps(groups, &c.groups),
        (CallerFilter::Roles { roles }, Some(c)) => overlaps(roles, &c.roles),
    }
}

/// Second stage: what came back.
pub fn code_passes(filter: &ResponseCodeFilter, ctx: &ResponseContext) -> bool {
    match filter {
        ResponseCodeFilter::Any => true,
        ResponseCodeFilter::HttpStatus { min, max } => (*min..=*max).contains(&ctx.status().as_u16()),
        ResponseCodeFilter::AppErrorCode { min, max } => ctx.errors().iter().any(|e| (*min..=*max).contains(&e.code)),
        ResponseCodeFilter::None => false,
    }
}

fn access_enabled(level: RecordLevel) -> bool {
    match level {
        RecordLevel::Off => false,
        RecordLevel::Trace => tracing::enabled!(target: ACCESS_TARGET, tracing::Level::TRACE),
        RecordLevel::Debug => tracing::enabled!(target: ACCESS_TARGET, tracing::Level::DEBUG),
        RecordLevel::Info => tracing::enabled!(target: ACCESS_TARGET, tracing::Level::INFO),
        RecordLevel::Warn => tracing::enabled!(target: ACCESS_TARGET, tracing::Level::WARN),
        RecordLevel::Error => tracing::enabled!(target: ACCESS_TARGET, tracing::Level::ERROR),
    }
}

fn emit(record: &RequestRecord, tx_id: &str) {
    let text = record.text.as_str();
    let overtime = record.overtime;
    match record.level {
        RecordLevel::Off => {}
        RecordLevel::Trace => tracing::trace!(target: ACCESS_TARGET, tx_id, overtime, "{text}"),
        RecordLevel::Debug => tracing::debug!(target: ACCESS_TARGET, tx_id, overtime, "{text}"),
        RecordLevel::Info => tracing::info!(target: ACCESS_TARGET, tx_id, overtime, "{text}"),
        RecordLevel::Warn => tracing::warn!(target: ACCESS_TARGET, tx_id, overtime, "{text}"),
        RecordLevel::Error => tracing::error!(target: ACCESS_TARGET, tx_id, overtime, "{text}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerboseConfig;
    use crate::http::context::tests::context_for;
    use crate::service::AppError;
    use http::{Method, StatusCode};

    fn admin() -> Caller {
        Caller {
            id: 7,
            name: "alice".into(),
            groups: vec!["ops".into()],
            roles: vec!["admin".into()],
        }
    }

    fn guest() -> Caller {
        Caller {
            id: 8,
            name: "bob".into(),
            groups: vec![],
            roles: vec!["viewer".into()],
        }
    }

    fn admin_errors_only() -> RequestLogger {
        RequestLogger::new(RequestLogConfig {
            verbose: VerboseConfig {
                caller: CallerFilter::Roles {
                    roles: vec!["admin".into()],
                },
                response_code: ResponseCodeFilter::HttpStatus { min: 500, max: 599 },
                ..VerboseConfig::default()
            },
            ..RequestLogConfig::default()
        })
    }

    fn verbose_for(logger: &RequestLogger, caller: Caller, status: StatusCode) -> bool {
        let mut ctx = context_for(Method::GET, "/orders", None);
        ctx.set_caller(caller).set_status(status);
        logger.render(&ctx).unwrap().verbose
    }

    #[test]
    fn verbose_needs_both_stages() {
        let logger = admin_errors_only();
        assert!(!verbose_for(&logger, admin(), StatusCode::OK));
        assert!(!verbose_for(&logger, guest(), StatusCode::INTERNAL_SERVER_ERROR));
        assert!(verbose_for(&logger, admin(), StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn anonymous_fails_identity_filters() {
        assert!(caller_passes(&CallerFilter::Any, None));
        assert!(!caller_passes(&CallerFilter::Ids { ids: vec![7] }, None));
        assert!(caller_passes(&CallerFilter::Groups { groups: vec!["ops".into()] }, Some(&admin())));
        assert!(caller_passes(&CallerFilter::Names { names: vec!["bob".into()] }, Some(&guest())));
    }

    #[test]
    fn app_code_range_matches_any_error() {
        let mut ctx = context_for(Method::GET, "/", None);
        ctx.add_error(AppError::new(10, "a")).add_error(AppError::new(2005, "b"));
        assert!(code_passes(&ResponseCodeFilter::AppErrorCode { min: 2000, max: 2999 }, &ctx));
        assert!(!code_passes(&ResponseCodeFilter::AppErrorCode { min: 3000, max: 3999 }, &ctx));
        assert!(!code_passes(&ResponseCodeFilter::None, &ctx));
    }

    #[test]
    fn overtime_escalates_to_warn() {
        let logger = RequestLogger::new(RequestLogConfig {
            level: RecordLevel::Debug,
            overtime_threshold_ms: 0,
            ..RequestLogConfig::default()
        });
        let mut ctx = context_for(Method::GET, "/slow", None);
        std::thread::sleep(Duration::from_millis(2));
        ctx.poi("end");
        let record = logger.render(&ctx).unwrap();
        assert!(record.overtime);
        assert_eq!(record.level, RecordLevel::Warn);
        assert!(record.text.contains("OVERTIME"));
    }

    #[test]
    fn poi_filter_selects_markers() {
        let logger = RequestLogger::new(RequestLogConfig {
            poi: PoiFilter::Only {
                names: vec!["db".into()],
            },
            ..RequestLogConfig::default()
        });
        let mut ctx = context_for(Method::GET, "/", None);
        ctx.poi("db").memo("db", "3 rows");
        let text = logger.render(&ctx).unwrap().text;
        assert!(text.contains("poi: db="), "{text}");
        assert!(!text.contains("begin="), "{text}");
        assert!(text.contains("memo db: 3 rows"));
        assert!(text.contains("caller: anonymous"));

        logger.reload(RequestLogConfig {
            poi: PoiFilter::None,
            ..RequestLogConfig::default()
        });
        assert!(!logger.render(&ctx).unwrap().text.contains("poi:"));
    }

    #[test]
    fn off_renders_nothing() {
        let logger = RequestLogger::new(RequestLogConfig {
            level: RecordLevel::Off,
            ..RequestLogConfig::default()
        });
        assert!(logger.render(&context_for(Method::GET, "/", None)).is_none());
    }

    #[test]
    fn disabled_access_target_skips_rendering() {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("request_engine::access=warn"))
            .with_writer(std::io::sink)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            assert!(!access_enabled(RecordLevel::Off));
            assert!(!access_enabled(RecordLevel::Info));
            assert!(access_enabled(RecordLevel::Warn));
            assert!(access_enabled(RecordLevel::Error));
        });
    }
}
