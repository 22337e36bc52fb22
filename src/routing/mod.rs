//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Reconciler (on every watch event):
//!     ChannelDefinition[]
//!     → table.rs (filter routable, key by hostname)
//!     → swappable.rs set() (atomic publish, version + 1)
//!
//! Incoming Request (Host header)
//!     → matcher.rs (normalize host, reject malformed)
//!     → swappable.rs get() (pin current snapshot)
//!     → Return: ChannelRoute or no route
//! ```
//!
//! # Design Decisions
//! - Tables are immutable; updates replace the whole table
//! - One snapshot per request: a request never sees two tables
//! - Explicit no-route rather than a silent default

pub mod matcher;
pub mod swappable;
pub mod table;

pub use swappable::{RoutingSnapshot, SwappableHandler};
pub use table::{ChannelDefinition, ChannelRef, ChannelRoute, RoutingTable, Subscriber, TableError};
