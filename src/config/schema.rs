//! Configuration schema definitions.
//!
//! This module defines the static configuration of the dispatcher.
//! All types derive Serde traits for deserialization from config files,
//! and every field has a default so an empty file is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the channel dispatcher.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Listener configuration (bind address, body limit).
    pub listener: ListenerConfig,

    /// Per-request time budgets.
    pub timeouts: TimeoutConfig,

    /// Startup/shutdown sequencing.
    pub lifecycle: LifecycleConfig,

    /// Channel resource store.
    pub store: StoreConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Largest accepted message body in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Per-request read and write budgets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to read the request body, in seconds.
    pub read_secs: u64,

    /// Time allowed to deliver and answer, in seconds.
    pub write_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: 60,
            write_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound on waiting for controllers to drain.
    /// Unset means wait for as long as it takes.
    pub drain_timeout_secs: Option<u64>,
}

impl LifecycleConfig {
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }
}

/// Channel store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the channel manifest.
    pub channels_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            channels_path: "/etc/channels/channels.toml".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Logging config file, watched for level changes.
    pub logging_config_path: String,

    /// Tracing config file, watched for sampling changes.
    /// Unset disables request tracing.
    pub tracing_config_path: Option<String>,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            logging_config_path: "/etc/config-logging/config.toml".to_string(),
            tracing_config_path: None,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
