//! Atomically swappable routing table.
//!
//! # Responsibilities
//! - Hold the currently published [`RoutingTable`]
//! - Lock-free reads for request handling
//! - Whole-table replacement for the reconciler
//!
//! # Design Decisions
//! - `ArcSwap` gives wait-free loads; readers pin an `Arc` and keep using it
//!   even if a newer table is published meanwhile
//! - Writers publish through `rcu`, so concurrent `set` calls are linearized
//!   and the version counter never skips or repeats
//! - Never empty: construction publishes the zero-channel table as version 0

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::observability::metrics;
use crate::routing::table::RoutingTable;

/// A published routing table plus its version.
///
/// The version only exists to make updates visible in logs.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    pub version: u64,
    pub table: Arc<RoutingTable>,
}

/// Handle to the current routing snapshot, shared between the dispatcher
/// and the reconciler.
#[derive(Debug, Clone)]
pub struct SwappableHandler {
    current: Arc<ArcSwap<RoutingSnapshot>>,
}

impl SwappableHandler {
    /// Create a handler holding the empty table.
    pub fn new_empty() -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(RoutingSnapshot {
                version: 0,
                table: Arc::new(RoutingTable::empty()),
            })),
        }
    }

    /// The most recently published table.
    pub fn get(&self) -> Arc<RoutingTable> {
        self.current.load().table.clone()
    }

    /// The most recently published snapshot, including its version.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.current.load_full()
    }

    /// Publish `table` as the current snapshot and return the new version.
    pub fn set(&self, table: RoutingTable) -> u64 {
        let table = Arc::new(table);
        let previous = self.current.rcu(|cur| RoutingSnapshot {
            version: cur.version + 1,
            table: table.clone(),
        });
        let version = previous.version + 1;

        if *previous.table == *table {
            tracing::debug!(version, channels = table.len(), "Routing table unchanged");
        } else {
            tracing::info!(
                version,
                previous_channels = previous.table.len(),
                channels = table.len(),
                "Routing table updated"
            );
        }
        metrics::record_routing_update(table.len());

        version
    }
}

impl Default for SwappableHandler {
    fn default() -> Self {
        Self::new_empty()
    }
}
