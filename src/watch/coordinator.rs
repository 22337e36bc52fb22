//! Watch coordination.
//!
//! # Responsibilities
//! - Subscribe to the store, then deliver the initial listing as `Added` events
//! - Open the [`SyncBarrier`] once the initial listing is fully delivered
//! - Forward incremental events until stop
//!
//! # Design Decisions
//! - Subscribe before list: a change racing the listing is delivered twice
//!   rather than lost, which idempotent reconciliation absorbs
//! - Failing to list is fatal; so is a feed that closes while running

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::latch::{Latch, LatchWaiter};
use crate::lifecycle::StopListener;
use crate::watch::store::{ChannelStore, StoreError, WatchEvent};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to subscribe to channel store: {0}")]
    Subscribe(#[source] StoreError),

    #[error("failed to list channels: {0}")]
    InitialList(#[source] StoreError),

    #[error("channel watch stream closed unexpectedly")]
    StreamClosed,

    #[error("watch stopped before initial sync completed")]
    StoppedBeforeSync,

    #[error("watch task panicked: {0}")]
    Panicked(String),

    #[error("watch coordinator not started")]
    NotStarted,
}

/// One-shot gate that opens when the initial listing has been delivered.
#[derive(Debug, Clone)]
pub struct SyncBarrier {
    latch: Latch,
}

impl SyncBarrier {
    fn new() -> Self {
        Self { latch: Latch::new() }
    }

    fn open(&self) -> bool {
        self.latch.open()
    }

    pub fn is_open(&self) -> bool {
        self.latch.is_open()
    }

    pub fn waiter(&self) -> SyncWaiter {
        SyncWaiter {
            waiter: self.latch.waiter(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncWaiter {
    waiter: LatchWaiter,
}

impl SyncWaiter {
    pub async fn wait(&mut self) {
        self.waiter.wait().await
    }
}

/// Receiving end of the coordinator's event stream.
pub type EventStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Drives a [`ChannelStore`] and feeds a single event stream.
pub struct WatchCoordinator<S: ChannelStore> {
    store: Arc<S>,
    events: Option<mpsc::UnboundedSender<WatchEvent>>,
    barrier: SyncBarrier,
    task: Option<JoinHandle<Result<(), WatchError>>>,
    finished: Option<Result<(), WatchError>>,
}

impl<S: ChannelStore> WatchCoordinator<S> {
    /// Create a coordinator and the stream its events arrive on.
    pub fn new(store: S) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store: Arc::new(store),
                events: Some(tx),
                barrier: SyncBarrier::new(),
                task: None,
                finished: None,
            },
            rx,
        )
    }

    pub fn barrier(&self) -> SyncBarrier {
        self.barrier.clone()
    }

    /// Start listing and watching on a background task.
    ///
    /// # Panics
    /// If called twice.
    pub fn start(&mut self, stop: StopListener) {
        let events = self.events.take().expect("watch coordinator started twice");
        let store = self.store.clone();
        let barrier = self.barrier.clone();

        tracing::info!("Starting channel watch");
        self.task = Some(tokio::spawn(run_watch(store, events, barrier, stop)));
    }

    /// Block until the barrier opens or the watch fails.
    pub async fn wait_for_sync(&mut self) -> Result<(), WatchError> {
        if self.barrier.is_open() {
            return Ok(());
        }
        let Some(task) = self.task.as_mut() else {
            return Err(WatchError::NotStarted);
        };

        let mut waiter = self.barrier.waiter();
        let outcome = tokio::select! {
            _ = waiter.wait() => return Ok(()),
            res = task => flatten(res),
        };
        self.task = None;

        // The task may have opened the barrier and then finished in the
        // same poll; an open barrier wins.
        if self.barrier.is_open() {
            self.finished = Some(outcome);
            return Ok(());
        }
        Err(outcome.err().unwrap_or(WatchError::StoppedBeforeSync))
    }

    /// Wait for the watch task to finish.
    ///
    /// Returns `Ok` once the task observed stop; an error if the watch failed.
    pub async fn join(&mut self) -> Result<(), WatchError> {
        if let Some(outcome) = self.finished.take() {
            return outcome;
        }
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let outcome = flatten(task.await);
        self.task = None;
        outcome
    }
}

fn flatten(res: Result<Result<(), WatchError>, tokio::task::JoinError>) -> Result<(), WatchError> {
    match res {
        Ok(outcome) => outcome,
        Err(e) => Err(WatchError::Panicked(e.to_string())),
    }
}

async fn run_watch<S: ChannelStore>(
    store: Arc<S>,
    events: mpsc::UnboundedSender<WatchEvent>,
    barrier: SyncBarrier,
    mut stop: StopListener,
) -> Result<(), WatchError> {
    let mut feed = store.watch().map_err(WatchError::Subscribe)?;
    let initial = tokio::select! {
        biased;
        _ = stop.wait() => {
            tracing::info!("Channel watch stopped before initial listing");
            return Ok(());
        }
        listed = store.list() => listed.map_err(WatchError::InitialList)?,
    };

    let count = initial.len();
    for def in initial {
        if events.send(WatchEvent::Added(def)).is_err() {
            tracing::debug!("Event consumer gone, ending watch");
            return Ok(());
        }
    }
    barrier.open();
    tracing::info!(channels = count, "Initial channel sync complete");

    loop {
        tokio::select! {
            biased;
            _ = stop.wait() => {
                tracing::info!("Channel watch stopping");
                return Ok(());
            }
            event = feed.recv() => match event {
                Some(event) => {
                    tracing::debug!(kind = event.kind(), channel = %event.channel_ref(), "Watch event");
                    if events.send(event).is_err() {
                        tracing::debug!("Event consumer gone, ending watch");
                        return Ok(());
                    }
                }
                None => {
                    if stop.is_stopped() {
                        return Ok(());
                    }
                    tracing::error!("Channel watch stream closed");
                    return Err(WatchError::StreamClosed);
                }
            },
        }
    }
}
