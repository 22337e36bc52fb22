//! One-shot gate.
//!
//! A [`Latch`] starts closed and opens at most once. Waiters that arrive
//! after it opened return immediately, which is what separates it from a
//! broadcast channel: late subscribers never miss the event.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub(crate) struct Latch {
    tx: Arc<watch::Sender<bool>>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Open the latch. Returns `true` only for the call that opened it.
    pub(crate) fn open(&self) -> bool {
        self.tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn waiter(&self) -> LatchWaiter {
        LatchWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LatchWaiter {
    rx: watch::Receiver<bool>,
}

impl LatchWaiter {
    /// Resolve once the latch is open.
    ///
    /// Also resolves when every `Latch` handle has been dropped, since the
    /// gate can then never open and nobody is left to release the waiter.
    pub(crate) async fn wait(&mut self) {
        let _ = self.rx.wait_for(|open| *open).await;
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.rx.borrow()
    }
}
