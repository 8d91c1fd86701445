//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ServerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [[listeners]]
            address = "0.0.0.0"
            port = 8443

            [idle]
            reader_idle_secs = 30
            "#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.listeners[0].port, 8443);
        assert_eq!(config.idle.reader_idle_secs, 30);
        assert_eq!(config.idle.writer_idle_secs, 0);
    }

    #[test]
    fn validation_failure_lists_fields() {
        let err = parse_config("[executor]\ncore_size = 0\n").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("listeners"), "{message}");
        assert!(message.contains("executor.core_size"), "{message}");
    }

    #[test]
    fn parse_error_surfaces() {
        assert!(matches!(parse_config("listeners = 3"), Err(ConfigError::Parse(_))));
    }
}
