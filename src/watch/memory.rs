//! In-process channel store.
//!
//! Holds channel definitions in memory and fans applied events out to every
//! open feed. Used to embed the dispatcher without an external store, and
//! by tests to script store behavior.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::routing::{ChannelDefinition, ChannelRef};
use crate::watch::store::{ChannelStore, EventFeed, StoreError, WatchEvent};

#[derive(Default)]
struct MemoryState {
    channels: BTreeMap<ChannelRef, ChannelDefinition>,
    feeds: Vec<mpsc::UnboundedSender<WatchEvent>>,
    list_error: Option<String>,
    list_stalled: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(channels: Vec<ChannelDefinition>) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for def in channels {
                state.channels.insert(def.channel_ref(), def);
            }
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().expect("memory store mutex poisoned")
    }

    /// Apply a change and notify every open feed.
    pub fn apply(&self, event: WatchEvent) {
        let mut state = self.lock();
        match &event {
            WatchEvent::Added(def) | WatchEvent::Updated(def) => {
                state.channels.insert(def.channel_ref(), def.clone());
            }
            WatchEvent::Deleted(r) => {
                state.channels.remove(r);
            }
        }
        state.feeds.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Make subsequent `list` calls fail.
    pub fn fail_listing(&self, reason: impl Into<String>) {
        self.lock().list_error = Some(reason.into());
    }

    /// Make subsequent `list` calls hang, as an unresponsive store would.
    pub fn stall_listing(&self) {
        self.lock().list_stalled = true;
    }

    /// Drop every open feed, as a store going away would.
    pub fn close_feeds(&self) {
        self.lock().feeds.clear();
    }

    pub fn channels(&self) -> Vec<ChannelDefinition> {
        self.lock().channels.values().cloned().collect()
    }
}

impl ChannelStore for MemoryStore {
    fn list(&self) -> impl Future<Output = Result<Vec<ChannelDefinition>, StoreError>> + Send {
        let state = self.lock();
        let stalled = state.list_stalled;
        let result = match &state.list_error {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(state.channels.values().cloned().collect()),
        };
        async move {
            if stalled {
                std::future::pending::<()>().await;
            }
            result
        }
    }

    fn watch(&self) -> Result<EventFeed, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().feeds.push(tx);
        Ok(EventFeed::new(rx))
    }
}
