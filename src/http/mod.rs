//! HTTP dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum, request ID, sampled trace span)
//!     → routing::matcher (Host → channel key)
//!     → routing::SwappableHandler::get (current snapshot)
//!     → delivery.rs (fan out to subscribers)
//!     → 202 / 4xx / 5xx to the sender
//! ```

pub mod delivery;
pub mod server;

pub use delivery::{Delivery, DeliveryError, HttpFanout, Message};
pub use server::{DispatchError, DispatcherArgs, DispatcherService};
