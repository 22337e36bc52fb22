//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::DispatcherConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<DispatcherConfig, ConfigError> {
    let config: DispatcherConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<DispatcherConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.timeouts.read_secs, 60);
        assert_eq!(config.timeouts.write_secs, 60);
        assert!(config.lifecycle.drain_timeout().is_none());
    }

    #[test]
    fn test_partial_override() {
        let config = parse_config(
            r#"
            [listener]
            bind_address = "127.0.0.1:9000"

            [timeouts]
            write_secs = 5

            [lifecycle]
            drain_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.bind_address, "127.0.0.1:9000");
        assert_eq!(config.timeouts.read_secs, 60);
        assert_eq!(config.timeouts.write_secs, 5);
        assert_eq!(config.lifecycle.drain_timeout_secs, Some(30));
    }

    #[test]
    fn test_invalid_config_reports_every_error() {
        let err = parse_config(
            r#"
            [listener]
            bind_address = "not-an-address"

            [timeouts]
            read_secs = 0
            "#,
        )
        .unwrap_err();

        let message = err.to_string();
        match err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation error, got {other}"),
        }
        assert!(message.starts_with("Validation failed: "));
        assert!(message.contains("must be greater than zero"));
        assert!(message.contains(", "));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/dispatcher.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
