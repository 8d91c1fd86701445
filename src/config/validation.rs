//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (pool sizes, limits, filter ranges)
//! - Check that referenced files exist (TLS material)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::IpAddr;
use std::path::Path;

use crate::config::schema::{CallerFilter, ResponseCodeFilter, ServerConfig, ThreadingMode};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listeners.is_empty() {
        errors.push(ValidationError::new("listeners", "at least one binding is required"));
    }
    for (i, binding) in config.listeners.iter().enumerate() {
        if binding.address.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::new(
                format!("listeners[{i}].address"),
                format!("'{}' is not an IP address", binding.address),
            ));
        }
    }

    if let Some(tls) = &config.tls {
        let files = [
            ("tls.cert_path", Some(&tls.cert_path)),
            ("tls.key_path", Some(&tls.key_path)),
            ("tls.trust_ca_path", tls.trust_ca_path.as_ref()),
        ];
        for (field, path) in files {
            if let Some(path) = path {
                if !Path::new(path).exists() {
                    errors.push(ValidationError::new(field, format!("file not found: {path}")));
                }
            }
        }
        if tls.protocols.is_empty() {
            errors.push(ValidationError::new("tls.protocols", "at least one protocol is required"));
        }
        for p in &tls.protocols {
            if p != "TLSv1.2" && p != "TLSv1.3" {
                errors.push(ValidationError::new("tls.protocols", format!("unsupported protocol '{p}'")));
            }
        }
        if tls.verify_hostname && tls.server_names.is_empty() {
            errors.push(ValidationError::new(
                "tls.server_names",
                "required when verify_hostname is enabled",
            ));
        }
    }

    if config.io.acceptor_threads == 0 {
        errors.push(ValidationError::new("io.acceptor_threads", "must be > 0"));
    }

    if config.codec.max_content_length == 0 {
        errors.push(ValidationError::new("codec.max_content_length", "must be > 0"));
    }
    if config.codec.max_chunk_size == 0 {
        errors.push(ValidationError::new("codec.max_chunk_size", "must be > 0"));
    }

    if config.executor.mode == ThreadingMode::Mixed {
        if config.executor.core_size == 0 {
            errors.push(ValidationError::new("executor.core_size", "must be > 0"));
        }
        if config.executor.max_size < config.executor.core_size {
            errors.push(ValidationError::new(
                "executor.max_size",
                format!(
                    "must be >= core_size ({} < {})",
                    config.executor.max_size, config.executor.core_size
                ),
            ));
        }
    }

    for path in &config.ping.paths {
        if !path.starts_with('/') {
            errors.push(ValidationError::new("ping.paths", format!("'{path}' must start with '/'")));
        }
    }

    if config.observability.sample_interval_ms == 0 {
        errors.push(ValidationError::new("observability.sample_interval_ms", "must be > 0"));
    }

    match &config.logging.verbose.response_code {
        ResponseCodeFilter::HttpStatus { min, max } if min > max => {
            errors.push(ValidationError::new(
                "logging.verbose.response_code",
                format!("empty status range {min}..={max}"),
            ));
        }
        ResponseCodeFilter::AppErrorCode { min, max } if min > max => {
            errors.push(ValidationError::new(
                "logging.verbose.response_code",
                format!("empty error code range {min}..={max}"),
            ));
        }
        _ => {}
    }
    let empty_caller_list = match &config.logging.verbose.caller {
        CallerFilter::Any => false,
        CallerFilter::Ids { ids } => ids.is_empty(),
        CallerFilter::Names { names } => names.is_empty(),
        CallerFilter::Groups { groups } => groups.is_empty(),
        CallerFilter::Roles { roles } => roles.is_empty(),
    };
    if empty_caller_list {
        errors.push(ValidationError::new("logging.verbose.caller", "filter list is empty"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn default_with_listener_is_valid() {
        let config = ServerConfig::with_listener("127.0.0.1", 0);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn collects_all_errors() {
        let mut config = ServerConfig::default();
        config.executor.core_size = 4;
        config.executor.max_size = 2;
        config.ping.paths = vec!["health".into()];
        config.logging.verbose.response_code = ResponseCodeFilter::HttpStatus { min: 599, max: 500 };

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"listeners"));
        assert!(fields.contains(&"executor.max_size"));
        assert!(fields.contains(&"ping.paths"));
        assert!(fields.contains(&"logging.verbose.response_code"));
    }

    #[test]
    fn sized_modes_skip_explicit_check() {
        let mut config = ServerConfig::with_listener("127.0.0.1", 0);
        config.executor.mode = ThreadingMode::CpuBound;
        config.executor.core_size = 0;
        config.executor.max_size = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn missing_tls_files_reported() {
        let mut config = ServerConfig::with_listener("127.0.0.1", 0);
        config.tls = Some(TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
            trust_ca_path: None,
            protocols: vec!["TLSv1.3".into()],
            ciphers: vec![],
            verify_hostname: false,
            server_names: vec![],
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
