//! Reconciliation subsystem.
//!
//! # Data Flow
//! ```text
//! EventStream (from the watch coordinator)
//!     → channel.rs: fold every queued event into known channels (keyed by ChannelRef)
//!     → RoutingTable::from_channels (full recompute, once per batch)
//!     → SwappableHandler::set (atomic publish)
//! ```
//!
//! # Design Decisions
//! - Full recompute per batch of queued events; no incremental patching
//! - The initial listing is folded by `prime` before traffic is admitted,
//!   so the first request already sees every pre-existing channel
//! - Keyed accumulation makes replays harmless (at-least-once delivery)
//! - Controllers are boxed trait objects so the orchestrator can hold a
//!   fixed, heterogeneous registration list

pub mod channel;

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::lifecycle::StopListener;

pub use channel::ReconciliationController;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("event stream closed before stop")]
    StreamClosed,

    #[error("{0}")]
    Failed(String),
}

/// A long-running loop driven by the orchestrator.
///
/// `run` must return once `stop` fires, after finishing any work item it
/// already dequeued.
pub trait Controller: Send + 'static {
    fn name(&self) -> &'static str;

    /// Apply everything delivered before the initial sync completed.
    ///
    /// Called once, after the sync barrier opened and before the dispatcher
    /// starts serving.
    fn prime(&mut self) -> Result<(), ControllerError> {
        Ok(())
    }

    fn run(self: Box<Self>, stop: StopListener) -> BoxFuture<'static, Result<(), ControllerError>>;
}
