//! Failures raised by the business callback and their classification.

use std::error::Error as StdError;

use serde::Serialize;

use crate::executor::RejectedExecution;

/// Application error codes reported in synthesized error bodies.
pub mod codes {
    pub const MALFORMED_REQUEST: i32 = 1000;
    pub const NAMING: i32 = 1001;
    pub const PERSISTENCE: i32 = 1002;
    pub const CONNECT_TIMEOUT: i32 = 1003;
    pub const REQUEST_TIMEOUT: i32 = 1004;
    pub const POOL_REJECTED: i32 = 1005;
    pub const IO_REJECTED: i32 = 1006;
    pub const IO_ERROR: i32 = 1007;
    pub const INTERRUPTED: i32 = 1008;
    pub const UNEXPECTED: i32 = 1009;
    pub const PAYLOAD_TOO_LARGE: i32 = 1010;
    pub const FILE_NOT_FOUND: i32 = 1011;
}

/// One entry of a response's error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppError {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub message: String,
    /// Internal detail. Logged, never serialized to clients.
    #[serde(skip)]
    pub cause: Option<String>,
}

impl AppError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            tag: None,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(tag) = &self.tag {
            write!(f, " ({tag})")?;
        }
        Ok(())
    }
}

/// A failure returned by the business callback.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Directory/naming service failure (e.g., LDAP).
    #[error("naming error: {0}")]
    Naming(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),
    #[error("request timeout: {0}")]
    RequestTimeout(String),
    /// A downstream executor refused the work.
    #[error(transparent)]
    Rejected(#[from] RejectedExecution),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("interrupted: {0}")]
    Interrupted(String),
    #[error("unexpected error: {0}")]
    Unexpected(Box<dyn StdError + Send + Sync>),
}

impl ServiceError {
    pub fn unexpected(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        ServiceError::Unexpected(error.into())
    }

    /// Classify into the closed set of handled kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Naming(_) => ErrorKind::Naming,
            ServiceError::Persistence(_) => ErrorKind::Persistence,
            ServiceError::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            ServiceError::RequestTimeout(_) => ErrorKind::RequestTimeout,
            ServiceError::Rejected(_) => ErrorKind::PoolRejection,
            ServiceError::Io(e) if caused_by_rejection(e) => ErrorKind::IoRejection,
            ServiceError::Io(_) => ErrorKind::IoGeneric,
            ServiceError::Interrupted(_) => ErrorKind::Interrupted,
            ServiceError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }
}

/// Walk the source chain of an I/O error looking for an executor rejection.
fn caused_by_rejection(error: &std::io::Error) -> bool {
    let mut next: Option<&(dyn StdError + 'static)> = error.get_ref().map(|e| e as &(dyn StdError + 'static));
    while let Some(e) = next {
        if e.is::<RejectedExecution>() {
            return true;
        }
        next = e.source();
    }
    false
}

/// Closed set of failure kinds, each routed to its own handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Naming,
    Persistence,
    ConnectTimeout,
    RequestTimeout,
    PoolRejection,
    IoRejection,
    IoGeneric,
    Interrupted,
    Unexpected,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Naming,
        ErrorKind::Persistence,
        ErrorKind::ConnectTimeout,
        ErrorKind::RequestTimeout,
        ErrorKind::PoolRejection,
        ErrorKind::IoRejection,
        ErrorKind::IoGeneric,
        ErrorKind::Interrupted,
        ErrorKind::Unexpected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Naming => "naming",
            ErrorKind::Persistence => "persistence",
            ErrorKind::ConnectTimeout => "connect_timeout",
            ErrorKind::RequestTimeout => "request_timeout",
            ErrorKind::PoolRejection => "pool_rejection",
            ErrorKind::IoRejection => "io_rejection",
            ErrorKind::IoGeneric => "io",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Unexpected => "unexpected",
        }
    }

    /// Application error code reported for this kind.
    pub fn app_code(&self) -> i32 {
        match self {
            ErrorKind::Naming => codes::NAMING,
            ErrorKind::Persistence => codes::PERSISTENCE,
            ErrorKind::ConnectTimeout => codes::CONNECT_TIMEOUT,
            ErrorKind::RequestTimeout => codes::REQUEST_TIMEOUT,
            ErrorKind::PoolRejection => codes::POOL_REJECTED,
            ErrorKind::IoRejection => codes::IO_REJECTED,
            ErrorKind::IoGeneric => codes::IO_ERROR,
            ErrorKind::Interrupted => codes::INTERRUPTED,
            ErrorKind::Unexpected => codes::UNEXPECTED,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PoolStats;

    fn rejection() -> RejectedExecution {
        RejectedExecution {
            pool: "biz".into(),
            stats: PoolStats::default(),
            shutdown: false,
        }
    }

    #[test]
    fn io_split_by_root_cause() {
        let plain = ServiceError::Io(std::io::Error::other("broken pipe"));
        assert_eq!(plain.kind(), ErrorKind::IoGeneric);

        let rejected = ServiceError::Io(std::io::Error::other(rejection()));
        assert_eq!(rejected.kind(), ErrorKind::IoRejection);
    }

    #[test]
    fn direct_rejection_is_pool_kind() {
        let err: ServiceError = rejection().into();
        assert_eq!(err.kind(), ErrorKind::PoolRejection);
    }

    #[test]
    fn serialized_app_error_hides_cause() {
        let e = AppError::new(42, "nope").with_tag("db").with_cause("secret dsn");
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, r#"{"code":42,"tag":"db","message":"nope"}"#);
    }
}
