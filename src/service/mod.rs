//! Business service boundary.
//!
//! # Data Flow
//! ```text
//! worker task
//!     → ServiceLifecycle::before_service (authenticator seat, may veto)
//!     → BizService::service
//!     → Err(ServiceError) → ServiceError::kind → ErrorHandlers table
//!     → ServiceLifecycle::after_service (after the response is written)
//! ```
//!
//! # Design Decisions
//! - Failures are values, not unwinding; panics are caught and treated as Unexpected
//! - The set of kinds is closed; handlers per kind are open

pub mod error;
pub mod handlers;

pub use error::{codes, AppError, ErrorKind, ServiceError};
pub use handlers::{default_status, ErrorHandler, ErrorHandlers};

use crate::http::context::ResponseContext;
use crate::http::request::RequestFacts;

/// The business dispatch callback. Runs on a worker thread and may block.
pub trait BizService: Send + Sync + 'static {
    fn service(&self, request: &RequestFacts, response: &mut ResponseContext) -> Result<(), ServiceError>;
}

impl<F> BizService for F
where
    F: Fn(&RequestFacts, &mut ResponseContext) -> Result<(), ServiceError> + Send + Sync + 'static,
{
    fn service(&self, request: &RequestFacts, response: &mut ResponseContext) -> Result<(), ServiceError> {
        self(request, response)
    }
}

/// Hooks around the business callback.
pub trait ServiceLifecycle: Send + Sync + 'static {
    /// Runs on the worker before the callback; authenticators set the caller
    /// here. Returning `false` skips the callback and leaves the response as
    /// the hook made it.
    fn before_service(&self, _request: &RequestFacts, _response: &mut ResponseContext) -> bool {
        true
    }

    /// Runs after the response was handed to the connection, before logging.
    fn after_service(&self, _response: &ResponseContext) {}
}

/// Lifecycle without hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

impl ServiceLifecycle for NoopLifecycle {}
