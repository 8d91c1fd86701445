//! Request dispatch.
//!
//! # States
//! ```text
//! DECODED ──malformed──────────────────────────────→ 400 ─┐
//!    │                                                    │
//!    ▼ executor.execute                                   │
//! QUEUED ──rejected────────────────────────────────→ 429 ─┤
//!    │                                                    │
//!    ▼ worker thread                                      │
//! PROCESSING (before_service → service → error table)     │
//!    │ oneshot back to the I/O task                       │
//!    ▼                                                    │
//! RESPONDING (render text | file | redirect) ←────────────┘
//!    ▼
//! LOGGED (after_service, END marker, request record)
//! ```
//!
//! # Design Decisions
//! - The I/O task never blocks: it awaits the worker's reply on a oneshot
//! - The response context moves I/O task → worker → I/O task; it is never shared
//! - Panics in business code are caught on the worker and classified as Unexpected

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, Response, StatusCode};
use tokio::sync::oneshot;

use crate::executor::{ExecutorHandle, RejectedExecution};
use crate::http::context::{accepts_xml, poi, LogToggles, ResponseContext};
use crate::http::request::{RequestFacts, X_REQUEST_ID};
use crate::http::response::{self, ResponseBody, ResponseDefaults, SendError};
use crate::net::ChannelInfo;
use crate::observability::{metrics, Counters, RequestLogger};
use crate::service::{codes, AppError, BizService, ErrorHandlers, ServiceError, ServiceLifecycle};

/// Response settings read per request, so reloads apply to the next request.
#[derive(Debug, Clone)]
pub struct ResponseSettings {
    pub defaults: Arc<ResponseDefaults>,
    pub max_chunk_size: usize,
}

/// Shared by every connection of a server.
pub struct Dispatcher {
    executor: ExecutorHandle,
    service: Arc<dyn BizService>,
    lifecycle: Arc<dyn ServiceLifecycle>,
    error_handlers: Arc<ErrorHandlers>,
    counters: Arc<Counters>,
    logger: Arc<RequestLogger>,
}

impl Dispatcher {
    pub fn new(
        executor: ExecutorHandle,
        service: Arc<dyn BizService>,
        lifecycle: Arc<dyn ServiceLifecycle>,
        error_handlers: Arc<ErrorHandlers>,
        counters: Arc<Counters>,
        logger: Arc<RequestLogger>,
    ) -> Self {
        Self {
            executor,
            service,
            lifecycle,
            error_handlers,
            counters,
            logger,
        }
    }

    pub fn logger(&self) -> &Arc<RequestLogger> {
        &self.logger
    }

    /// Run one aggregated request through the state machine.
    pub async fn dispatch(
        self: &Arc<Self>,
        channel: ChannelInfo,
        parts: Parts,
        body: Bytes,
        settings: &ResponseSettings,
    ) -> Result<Response<ResponseBody>, SendError> {
        let tx_id = transaction_id(&parts.headers);
        let xml = accepts_xml(&parts.headers);
        let (method, uri) = (parts.method.clone(), parts.uri.clone());

        // DECODED
        let facts = match RequestFacts::decode(channel, parts, body) {
            Ok(facts) => Arc::new(facts),
            Err(e) => {
                tracing::warn!(tx_id = %tx_id, peer = %channel.peer, %method, %uri, error = %e, "Malformed request rejected");
                let response = response::error_response(
                    StatusCode::BAD_REQUEST,
                    AppError::new(codes::MALFORMED_REQUEST, e.to_string()).with_tag("malformed_request"),
                    xml,
                    &tx_id,
                    &settings.defaults,
                );
                self.counters.sent();
                return response;
            }
        };

        let hit = self.counters.hit();
        let toggles = self.log_toggles();
        let mut ctx = ResponseContext::new(tx_id.clone(), hit, Arc::clone(&facts), toggles);

        // QUEUED
        ctx.poi(poi::QUEUED);
        let (reply_tx, reply_rx) = oneshot::channel();
        let worker = Arc::clone(self);
        let submitted = self.executor.execute(move || {
            let ctx = worker.process(ctx);
            // the receiver is gone only if the connection closed meanwhile
            if let Err(ctx) = reply_tx.send(ctx) {
                worker.abandoned(ctx);
            }
        });

        let mut ctx = match submitted {
            Ok(()) => match reply_rx.await {
                Ok(ctx) => ctx,
                Err(_) => {
                    let mut ctx = ResponseContext::new(tx_id, hit, facts, toggles);
                    ctx.fail(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        AppError::new(codes::UNEXPECTED, "Internal Server Error")
                            .with_tag("unexpected")
                            .with_cause("worker dropped the request"),
                    );
                    ctx
                }
            },
            Err(rejected) => self.rejected(tx_id, hit, facts, toggles, rejected),
        };

        // RESPONDING
        let rendered = response::render(&mut ctx, &settings.defaults, settings.max_chunk_size).await;
        ctx.poi(poi::RESPONDED);
        if rendered.is_ok() {
            self.counters.sent();
        }

        // LOGGED
        self.finish(&mut ctx);
        if let Err(e) = &rendered {
            tracing::error!(
                tx_id = %ctx.tx_id(),
                peer = %channel.peer,
                connection_id = %channel.id,
                %method,
                %uri,
                status = ctx.status().as_u16(),
                errors = ctx.errors().len(),
                error = %e,
                "Failed to send response"
            );
        }
        rendered
    }

    fn log_toggles(&self) -> LogToggles {
        let config = self.logger.config();
        let verbose = &config.verbose;
        LogToggles {
            request_header: verbose.request_header,
            request_body: verbose.request_body,
            response_header: verbose.response_header,
            response_body: verbose.response_body,
        }
    }

    /// Runs on a worker thread.
    fn process(&self, mut ctx: ResponseContext) -> ResponseContext {
        ctx.poi(poi::PROCESS_BEGIN);
        self.counters.biz_hit();
        let request = ctx.request_arc();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if self.lifecycle.before_service(&request, &mut ctx) {
                self.service.service(&request, &mut ctx)
            } else {
                Ok(())
            }
        }));
        let result = outcome.unwrap_or_else(|panic| {
            Err(ServiceError::unexpected(format!(
                "business service panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

        if let Err(error) = result {
            let handled = catch_unwind(AssertUnwindSafe(|| self.error_handlers.handle(&error, &mut ctx)));
            if let Err(panic) = handled {
                tracing::error!(
                    tx_id = %ctx.tx_id(),
                    kind = %error.kind(),
                    panic = %panic_message(panic.as_ref()),
                    "Error handler panicked"
                );
                ctx.fail(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    AppError::new(codes::UNEXPECTED, "Internal Server Error").with_tag("unexpected"),
                );
            }
        }
        ctx.poi(poi::PROCESS_END);
        ctx
    }

    fn rejected(
        &self,
        tx_id: String,
        hit: u64,
        facts: Arc<RequestFacts>,
        toggles: LogToggles,
        rejected: RejectedExecution,
    ) -> ResponseContext {
        metrics::record_rejection();
        let mut ctx = ResponseContext::new(tx_id, hit, facts, toggles);
        ctx.poi(poi::QUEUED);
        ctx.set_header("retry-after", "1").fail(
            StatusCode::TOO_MANY_REQUESTS,
            AppError::new(codes::POOL_REJECTED, "Too Many Requests")
                .with_tag("pool_rejection")
                .with_cause(rejected.to_string()),
        );
        ctx
    }

    /// The connection went away while the worker held the request. The
    /// response is dropped but the request still gets its final step.
    fn abandoned(&self, mut ctx: ResponseContext) {
        let request = ctx.request_arc();
        tracing::error!(
            tx_id = %ctx.tx_id(),
            peer = %request.channel.peer,
            connection_id = %request.channel.id,
            method = %request.method,
            path = %request.path,
            status = ctx.status().as_u16(),
            "Failed to send response, connection closed"
        );
        ctx.memo("send", "connection closed before the response was written");
        self.finish(&mut ctx);
    }

    fn finish(&self, ctx: &mut ResponseContext) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.lifecycle.after_service(ctx))) {
            tracing::error!(tx_id = %ctx.tx_id(), panic = %panic_message(panic.as_ref()), "after_service hook panicked");
        }
        ctx.poi(poi::END);
        self.logger.log(ctx);
    }
}

/// Reuse a sane client-supplied request id, otherwise mint one.
pub(crate) fn transaction_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128 && v.bytes().all(|b| b.is_ascii_graphic()))
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestLogConfig;
    use crate::executor::PoolSizing;
    use crate::http::context::Caller;
    use crate::net::ConnectionId;
    use crate::service::ErrorKind;
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn channel() -> ChannelInfo {
        ChannelInfo {
            id: ConnectionId::new(),
            peer: "127.0.0.1:5000".parse().unwrap(),
            local: "127.0.0.1:8080".parse().unwrap(),
            tls: false,
        }
    }

    fn settings() -> ResponseSettings {
        ResponseSettings {
            defaults: Arc::new(ResponseDefaults::default()),
            max_chunk_size: 8192,
        }
    }

    fn dispatcher<S>(service: S, lifecycle: Arc<dyn ServiceLifecycle>, core: usize) -> Arc<Dispatcher>
    where
        S: Fn(&RequestFacts, &mut ResponseContext) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        let executor = ExecutorHandle::new(PoolSizing {
            core,
            max: core,
            queue_capacity: 0,
            keep_alive: Duration::from_secs(1),
        });
        Arc::new(Dispatcher::new(
            executor,
            Arc::new(service),
            lifecycle,
            Arc::new(ErrorHandlers::new()),
            Arc::new(Counters::new()),
            Arc::new(RequestLogger::new(RequestLogConfig::default())),
        ))
    }

    fn get(uri: &str) -> Parts {
        http::Request::get(uri).body(()).unwrap().into_parts().0
    }

    async fn text(response: Response<ResponseBody>) -> String {
        String::from_utf8(response.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn success_runs_on_worker() {
        let d = dispatcher(
            |req, ctx| {
                let worker = std::thread::current().name().unwrap_or_default().to_string();
                ctx.set_text(format!("{} on {}", req.path, worker.split('-').next().unwrap_or("")));
                Ok(())
            },
            Arc::new(crate::service::NoopLifecycle),
            1,
        );
        let response = d.dispatch(channel(), get("/hello%20world"), Bytes::new(), &settings()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "/hello world on biz");
        assert_eq!(d.counters.hits(), 1);
        assert_eq!(d.counters.biz_hits(), 1);
        assert_eq!(d.counters.sent_count(), 1);
    }

    #[tokio::test]
    async fn malformed_bypasses_pool() {
        let d = dispatcher(
            |_, _| panic!("must not run"),
            Arc::new(crate::service::NoopLifecycle),
            1,
        );
        let response = d.dispatch(channel(), get("/bad%zz"), Bytes::new(), &settings()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().contains_key(X_REQUEST_ID));
        assert!(text(response).await.contains("1000"));
        assert_eq!(d.counters.hits(), 0);
        assert_eq!(d.counters.biz_hits(), 0);
    }

    #[tokio::test]
    async fn failures_route_through_error_table() {
        let d = dispatcher(
            |_, _| Err(ServiceError::ConnectTimeout("ldap:389".into())),
            Arc::new(crate::service::NoopLifecycle),
            1,
        );
        let response = d.dispatch(channel(), get("/x"), Bytes::new(), &settings()).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(text(response).await.contains(&ErrorKind::ConnectTimeout.app_code().to_string()));
    }

    #[tokio::test]
    async fn panic_becomes_unexpected() {
        let d = dispatcher(
            |_, _| panic!("kaboom"),
            Arc::new(crate::service::NoopLifecycle),
            1,
        );
        let response = d.dispatch(channel(), get("/x"), Bytes::new(), &settings()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = text(response).await;
        assert!(body.contains("\"code\":1009"), "{body}");
    }

    #[tokio::test]
    async fn saturated_pool_answers_429() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = parking_lot::Mutex::new(release_rx);
        let d = dispatcher(
            move |_, ctx| {
                let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
                ctx.set_text("done");
                Ok(())
            },
            Arc::new(crate::service::NoopLifecycle),
            1,
        );

        let first = {
            let d = d.clone();
            tokio::spawn(async move { d.dispatch(channel(), get("/slow"), Bytes::new(), &settings()).await })
        };
        // wait until the only worker is busy
        for _ in 0..200 {
            if d.executor.stats().active == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = d.dispatch(channel(), get("/slow"), Bytes::new(), &settings()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["retry-after"], "1");

        release_tx.send(()).unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unsendable_response_is_reported_not_counted() {
        let d = dispatcher(
            |_, ctx| {
                ctx.add_header("x-broken", "a\nb");
                ctx.set_text("never sent");
                Ok(())
            },
            Arc::new(crate::service::NoopLifecycle),
            1,
        );
        let err = d
            .dispatch(channel(), get("/x"), Bytes::new(), &settings())
            .await
            .err()
            .expect("render should fail");
        assert!(matches!(err, SendError::HeaderValue(ref name) if name == "x-broken"), "{err}");
        assert_eq!(d.counters.biz_hits(), 1);
        assert_eq!(d.counters.sent_count(), 0);
    }

    #[derive(Default)]
    struct Finished(std::sync::atomic::AtomicUsize);

    impl ServiceLifecycle for Finished {
        fn after_service(&self, _response: &ResponseContext) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn abandoned_request_still_runs_after_service() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = parking_lot::Mutex::new(release_rx);
        let finished = Arc::new(Finished::default());
        let d = dispatcher(
            move |_, ctx| {
                let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
                ctx.set_text("late");
                Ok(())
            },
            finished.clone(),
            1,
        );

        let pending = {
            let d = d.clone();
            tokio::spawn(async move { d.dispatch(channel(), get("/slow"), Bytes::new(), &settings()).await })
        };
        for _ in 0..200 {
            if d.executor.stats().active == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // the connection goes away while the worker holds the request
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        release_tx.send(()).unwrap();

        for _ in 0..200 {
            if finished.0.load(std::sync::atomic::Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(finished.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(d.counters.sent_count(), 0);
    }

    struct Authenticator;

    impl ServiceLifecycle for Authenticator {
        fn before_service(&self, request: &RequestFacts, ctx: &mut ResponseContext) -> bool {
            match request.header("authorization") {
                Some("Bearer admin") => {
                    ctx.set_caller(Caller {
                        id: 1,
                        name: "admin".into(),
                        ..Caller::default()
                    });
                    true
                }
                _ => {
                    ctx.fail(StatusCode::UNAUTHORIZED, AppError::new(401, "login required"));
                    false
                }
            }
        }
    }

    #[tokio::test]
    async fn before_service_may_veto() {
        let d = dispatcher(
            |_, ctx| {
                ctx.set_text(ctx.caller().map(|c| c.name.clone()).unwrap_or_default());
                Ok(())
            },
            Arc::new(Authenticator),
            1,
        );
        let denied = d.dispatch(channel(), get("/me"), Bytes::new(), &settings()).await.unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let parts = http::Request::get("/me")
            .header("authorization", "Bearer admin")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let allowed = d.dispatch(channel(), parts, Bytes::new(), &settings()).await.unwrap();
        assert_eq!(text(allowed).await, "admin");
    }

    #[test]
    fn client_request_id_is_reused_when_sane() {
        let parts = http::Request::get("/").header(X_REQUEST_ID, "abc-123").body(()).unwrap().into_parts().0;
        assert_eq!(transaction_id(&parts.headers), "abc-123");
        let parts = http::Request::get("/").header(X_REQUEST_ID, "has space").body(()).unwrap().into_parts().0;
        assert_ne!(transaction_id(&parts.headers), "has space");
    }
}
