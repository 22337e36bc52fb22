//! In-memory channel dispatcher.
//!
//! Receives HTTP events addressed to a channel by hostname and fans them out
//! to the channel's subscribers. The routing table is rebuilt from a watched
//! channel store and swapped in atomically.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌───────────────────────────────────────────────────┐
//!                      │                CHANNEL DISPATCHER                 │
//!                      │                                                   │
//!   Channel store      │  ┌──────────┐   ┌─────────────┐   ┌────────────┐  │
//!   ───────────────────┼─▶│  watch   │──▶│ reconciler  │──▶│  routing   │  │
//!   (list + events)    │  │coordinator│  │ controller  │   │ swappable  │  │
//!                      │  └──────────┘   └─────────────┘   └─────┬──────┘  │
//!                      │                                        │ load    │
//!   Event (Host: ch)   │  ┌──────────────────────────────┐      ▼         │
//!   ───────────────────┼─▶│  http server (dispatcher)    │◀─ snapshot     │
//!                      │  └──────────────┬───────────────┘                │
//!                      │                 │ fan-out                        │
//!                      │                 ▼                                │
//!                      │  ┌──────────────────────────────┐                │
//!                      │  │  http delivery (subscribers) │────────────────┼──▶ Subscribers
//!                      │  └──────────────────────────────┘                │
//!                      │                                                   │
//!                      │  ┌─────────────────────────────────────────────┐  │
//!                      │  │ lifecycle: construct → sync → run → drain   │  │
//!                      │  │ config: TOML + file watch │ observability   │  │
//!                      │  └─────────────────────────────────────────────┘  │
//!                      └───────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod routing;

// Control plane
pub mod reconciler;
pub mod watch;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::DispatcherConfig;
pub use http::DispatcherService;
pub use lifecycle::{LifecycleOrchestrator, StopSignal};
pub use routing::SwappableHandler;
