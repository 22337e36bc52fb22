//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT/SIGQUIT → StopSignal::trigger
//!     second signal → immediate exit
//!
//! StopSignal (shutdown.rs):
//!     one-shot, broadcast to every long-running loop via StopListener
//!
//! Orchestration (orchestrator.rs):
//!     Constructing → WaitingForSync → Running → Draining → Stopped
//! ```
//!
//! # Design Decisions
//! - Ordered startup: routing handler first, traffic only after sync
//! - Ordered shutdown: controllers drain, then the dispatcher stops
//! - Drain is a cooperative join; a deadline is opt-in

pub(crate) mod latch;
pub mod orchestrator;
pub mod shutdown;
pub mod signals;

pub use orchestrator::{LifecycleError, LifecycleOrchestrator, Phase, NUM_CONTROLLERS};
pub use shutdown::{StopListener, StopSignal};
