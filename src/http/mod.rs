//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection
//!     → server.rs (accept loops, runtimes, reload, shutdown)
//!     → pipeline.rs (per-connection stage list, codec, request stages)
//!     → upload.rs / websocket.rs / ping.rs (intercepting stages)
//!     → dispatch.rs (decode → queue → process → respond → log)
//!         → request.rs (decoded request facts)
//!         → context.rs (per-request response context)
//!         → response.rs (render text, file or redirect)
//!     → Send to client
//! ```

pub mod context;
pub mod dispatch;
pub mod pipeline;
pub mod ping;
pub mod request;
pub mod response;
pub mod server;
pub mod upload;
pub mod websocket;

pub use context::{Caller, LogToggles, Payload, ResponseContext};
pub use dispatch::Dispatcher;
pub use ping::{PingLifecycle, PingOutcome};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineError, Stage};
pub use request::{RequestFacts, X_REQUEST_ID};
pub use server::{HttpServer, ServerBuilder, ServerError, ServerHandle};
pub use upload::{UploadError, UploadHandler};
pub use websocket::WebSocketHandler;
