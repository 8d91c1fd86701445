//! Lookup table routing each failure kind to its handler.
//!
//! Every `ErrorKind` has a default handler that sets an HTTP status, appends
//! an `AppError` and logs. Applications override individual kinds to add
//! alerting or custom responses without touching the others.

use std::collections::HashMap;
use std::sync::Arc;

use http::StatusCode;

use crate::http::context::ResponseContext;
use crate::service::error::{AppError, ErrorKind, ServiceError};

/// Handler invoked with the failure and the request's context.
pub type ErrorHandler = Arc<dyn Fn(&ServiceError, &mut ResponseContext) + Send + Sync>;

/// Status set by the default handler of each kind.
pub fn default_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Naming => StatusCode::BAD_GATEWAY,
        ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::ConnectTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::PoolRejection => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::IoRejection => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::IoGeneric => StatusCode::BAD_GATEWAY,
        ErrorKind::Interrupted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Unexpected => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn default_handler(kind: ErrorKind) -> ErrorHandler {
    Arc::new(move |error: &ServiceError, ctx: &mut ResponseContext| {
        let status = default_status(kind);
        if kind == ErrorKind::Unexpected {
            tracing::error!(tx_id = %ctx.tx_id(), kind = %kind, error = %error, "Unexpected failure in business service");
        } else {
            tracing::warn!(tx_id = %ctx.tx_id(), kind = %kind, error = %error, "Business service failed");
        }
        let message = status.canonical_reason().unwrap_or("Error").to_string();
        ctx.fail(
            status,
            AppError::new(kind.app_code(), message)
                .with_tag(kind.as_str())
                .with_cause(error.to_string()),
        );
    })
}

/// Kind → handler table.
#[derive(Clone)]
pub struct ErrorHandlers {
    table: HashMap<ErrorKind, ErrorHandler>,
}

impl Default for ErrorHandlers {
    fn default() -> Self {
        let table = ErrorKind::ALL
            .iter()
            .map(|kind| (*kind, default_handler(*kind)))
            .collect();
        Self { table }
    }
}

impl ErrorHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the handler for one kind.
    pub fn set<F>(&mut self, kind: ErrorKind, handler: F)
    where
        F: Fn(&ServiceError, &mut ResponseContext) + Send + Sync + 'static,
    {
        self.table.insert(kind, Arc::new(handler));
    }

    /// Builder form of [`ErrorHandlers::set`].
    pub fn on<F>(mut self, kind: ErrorKind, handler: F) -> Self
    where
        F: Fn(&ServiceError, &mut ResponseContext) + Send + Sync + 'static,
    {
        self.set(kind, handler);
        self
    }

    /// Route a failure to the handler of its kind.
    pub fn handle(&self, error: &ServiceError, ctx: &mut ResponseContext) {
        let kind = error.kind();
        match self.table.get(&kind) {
            Some(handler) => handler(error, ctx),
            None => default_handler(kind)(error, ctx),
        }
    }
}

impl std::fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandlers")
            .field("kinds", &self.table.len())
            .finish()
    }
}
