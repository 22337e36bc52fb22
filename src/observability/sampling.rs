//! Request trace sampling.
//!
//! # Responsibilities
//! - Hold the current tracing configuration
//! - Decide per request whether a trace span is recorded
//!
//! # Design Decisions
//! - Config swapped atomically; the request path never locks
//! - Disabled unless the tracing config enables it

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::watcher::{Observer, ObserverResult};

#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("failed to read tracing config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse tracing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("sample_rate must be within [0, 1], got {0}")]
    SampleRate(f64),
}

/// Tracing configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    pub enabled: bool,

    /// Fraction of requests that get a span.
    pub sample_rate: f64,

    /// Collector endpoint, reported in logs for operators.
    pub endpoint: Option<Url>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 0.1,
            endpoint: None,
        }
    }
}

impl TracingConfig {
    pub fn from_toml(content: &str) -> Result<Self, SamplingError> {
        let config: TracingConfig = toml::from_str(content)?;
        if !(0.0..=1.0).contains(&config.sample_rate) {
            return Err(SamplingError::SampleRate(config.sample_rate));
        }
        Ok(config)
    }
}

/// Shared, hot-swappable sampling decision.
#[derive(Debug, Clone)]
pub struct SamplingPolicy {
    current: Arc<ArcSwap<TracingConfig>>,
}

impl SamplingPolicy {
    pub fn new(config: TracingConfig) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(TracingConfig::default())
    }

    pub fn config(&self) -> Arc<TracingConfig> {
        self.current.load_full()
    }

    pub fn update(&self, config: TracingConfig) {
        tracing::info!(
            enabled = config.enabled,
            sample_rate = config.sample_rate,
            endpoint = ?config.endpoint.as_ref().map(Url::as_str),
            "Tracing config updated"
        );
        self.current.store(Arc::new(config));
    }

    pub fn should_sample(&self) -> bool {
        let config = self.current.load();
        config.enabled && config.sample_rate > 0.0 && fastrand::f64() < config.sample_rate
    }
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// ConfigWatcher observer that swaps in each new tracing config.
pub fn update_sampling_from_config(policy: SamplingPolicy) -> Observer {
    Box::new(move |content: &str| -> ObserverResult {
        policy.update(TracingConfig::from_toml(content)?);
        Ok(())
    })
}
