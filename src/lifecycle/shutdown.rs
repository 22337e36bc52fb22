//! Stop signal for graceful shutdown.

use crate::lifecycle::latch::{Latch, LatchWaiter};

/// Single-fire cancellation token meaning "begin graceful shutdown".
///
/// Every long-running loop receives a [`StopListener`] from this signal.
/// The signal fires at most once and is never reset; listeners created after
/// it fired observe it immediately.
#[derive(Debug, Clone)]
pub struct StopSignal {
    latch: Latch,
}

impl StopSignal {
    /// Create a new, untriggered stop signal.
    pub fn new() -> Self {
        Self { latch: Latch::new() }
    }

    /// Hand out a listener for a long-running task.
    pub fn listener(&self) -> StopListener {
        StopListener {
            waiter: self.latch.waiter(),
        }
    }

    /// Fire the signal.
    ///
    /// Returns `true` for the call that actually fired it; later calls are
    /// no-ops and return `false`.
    pub fn trigger(&self) -> bool {
        let fired = self.latch.open();
        if fired {
            tracing::info!("Stop signal triggered");
        }
        fired
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        self.latch.is_open()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`StopSignal`].
#[derive(Debug, Clone)]
pub struct StopListener {
    waiter: LatchWaiter,
}

impl StopListener {
    /// Wait until the stop signal fires. Returns immediately if it already has.
    pub async fn wait(&mut self) {
        self.waiter.wait().await
    }

    /// Non-blocking check of the signal.
    pub fn is_stopped(&self) -> bool {
        self.waiter.is_open()
    }
}
