//! Channel watch subsystem.
//!
//! # Data Flow
//! ```text
//! ChannelStore (file manifest, in-memory, ...)
//!     → store.rs watch() (subscribe to changes)
//!     → store.rs list() (initial state)
//!     → coordinator.rs: initial listing as Added events
//!     → SyncBarrier opens
//!     → coordinator.rs: incremental events until stop
//!     → EventStream consumed by the reconciler
//! ```
//!
//! # Design Decisions
//! - Traffic is not served until the barrier opens
//! - Delivery is at-least-once; consumers must be idempotent

pub mod coordinator;
pub mod file;
pub mod memory;
pub mod store;

pub use coordinator::{EventStream, SyncBarrier, WatchCoordinator, WatchError};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{ChannelStore, EventFeed, StoreError, WatchEvent};
