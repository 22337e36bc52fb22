//! Channel store interface.

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::routing::{ChannelDefinition, ChannelRef};

/// A change to a channel resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(ChannelDefinition),
    Updated(ChannelDefinition),
    Deleted(ChannelRef),
}

impl WatchEvent {
    pub fn channel_ref(&self) -> ChannelRef {
        match self {
            WatchEvent::Added(def) | WatchEvent::Updated(def) => def.channel_ref(),
            WatchEvent::Deleted(r) => r.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Updated(_) => "updated",
            WatchEvent::Deleted(_) => "deleted",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read channel manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse channel manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to watch channel manifest: {0}")]
    Notify(#[from] notify::Error),
}

/// Incremental change feed from a store.
///
/// Whatever keeps the feed alive on the store side (a file watcher, a
/// connection) is held in `guard` and released with the feed.
pub struct EventFeed {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    _guard: Option<Box<dyn Send>>,
}

impl EventFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx, _guard: None }
    }

    pub fn with_guard(rx: mpsc::UnboundedReceiver<WatchEvent>, guard: impl Send + 'static) -> Self {
        Self {
            rx,
            _guard: Some(Box::new(guard)),
        }
    }

    /// Next event, or `None` once the store closed the feed.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Source of channel definitions.
///
/// Mirrors list-then-watch semantics: `watch` yields changes from the moment
/// it is called, `list` the full current state.
pub trait ChannelStore: Send + Sync + 'static {
    fn list(&self) -> impl Future<Output = Result<Vec<ChannelDefinition>, StoreError>> + Send;

    fn watch(&self) -> Result<EventFeed, StoreError>;
}
