//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! dispatcher config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → DispatcherConfig (validated, immutable)
//!
//! Dynamic config (logging level, trace sampling):
//!     watcher.rs loads each file once at startup (fatal on failure)
//!     → notify detects change
//!     → observer parses and applies in place
//!     → on failure the previous configuration stays in effect
//! ```
//!
//! # Design Decisions
//! - Static config is immutable once loaded; changes require restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{DispatcherConfig, LifecycleConfig, ListenerConfig, ObservabilityConfig, StoreConfig, TimeoutConfig};
pub use watcher::{ConfigWatcher, ConfigWatcherGuard};
