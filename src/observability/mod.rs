//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     LoggingConfig (hard-coded or file)
//!     → logging.rs init (reloadable EnvFilter + fmt layer)
//!     → LevelHandle kept for live updates
//!
//! At runtime (ConfigWatcher observers):
//!     logging config change → logging.rs update_level_from_config
//!     tracing config change → sampling.rs update_sampling_from_config
//!
//! All subsystems produce:
//!     → structured log events (tracing macros)
//!     → metrics.rs (counters, gauges, histograms)
//! ```
//!
//! # Design Decisions
//! - Observability failures degrade, never stop traffic
//! - Only the initial config load is fatal

pub mod logging;
pub mod metrics;
pub mod sampling;

pub use logging::{LevelHandle, LogFormat, LoggingConfig, LoggingError};
pub use sampling::{SamplingPolicy, TracingConfig};
