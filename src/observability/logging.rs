//! Structured logging with a live-adjustable level.
//!
//! # Responsibilities
//! - Initialize the global subscriber from a [`LoggingConfig`]
//! - Swap the level filter at runtime without restarting
//!
//! # Design Decisions
//! - JSON output by default (machine parsing), text for local debugging
//! - Per-component overrides only touch this crate's targets

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{
    filter::ParseError, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
    util::TryInitError, EnvFilter, Registry,
};

use crate::config::watcher::{Observer, ObserverResult};

/// Component name used to pick a level override.
pub const COMPONENT: &str = "dispatcher";

const CRATE_TARGET: &str = "channel_dispatcher";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to read logging config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse logging config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid log level: {0}")]
    Level(#[from] ParseError),

    #[error("failed to install subscriber: {0}")]
    Install(#[from] TryInitError),

    #[error("failed to reload log level: {0}")]
    Reload(#[from] reload::Error),
}

/// Output encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global level (trace, debug, info, warn, error).
    pub level: String,

    pub format: LogFormat,

    /// Per-component level overrides, e.g. `dispatcher = "debug"`.
    pub components: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            components: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    pub fn from_toml(content: &str) -> Result<Self, LoggingError> {
        let config: LoggingConfig = toml::from_str(content)?;
        // Reject bad levels at load time rather than on first apply.
        config.filter(COMPONENT)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, LoggingError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Filter directive for `component`.
    pub fn directive(&self, component: &str) -> String {
        match self.components.get(component) {
            Some(level) => format!("{},{}={}", self.level, CRATE_TARGET, level),
            None => self.level.clone(),
        }
    }

    pub fn filter(&self, component: &str) -> Result<EnvFilter, LoggingError> {
        Ok(EnvFilter::try_new(self.directive(component))?)
    }
}

/// Handle to the installed level filter.
#[derive(Clone)]
pub struct LevelHandle {
    inner: reload::Handle<EnvFilter, Registry>,
    component: String,
}

impl LevelHandle {
    /// Replace the active filter with the one described by `config`.
    pub fn apply(&self, config: &LoggingConfig) -> Result<(), LoggingError> {
        let filter = config.filter(&self.component)?;
        self.inner.reload(filter)?;
        tracing::info!(directive = %config.directive(&self.component), "Log level updated");
        Ok(())
    }
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig, component: &str) -> Result<LevelHandle, LoggingError> {
    let (filter, handle) = reload::Layer::new(config.filter(component)?);
    let json = config.format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .try_init()?;

    Ok(LevelHandle {
        inner: handle,
        component: component.to_string(),
    })
}

/// ConfigWatcher observer that re-applies the log level on every change.
pub fn update_level_from_config(handle: LevelHandle) -> Observer {
    Box::new(move |content: &str| -> ObserverResult {
        let config = LoggingConfig::from_toml(content)?;
        handle.apply(&config)?;
        Ok(())
    })
}
