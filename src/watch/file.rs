//! Manifest-file channel store.
//!
//! # Responsibilities
//! - Read channel definitions from a TOML manifest (`[[channels]]` tables)
//! - Watch the manifest and turn each rewrite into Added/Updated/Deleted events
//!
//! # Design Decisions
//! - The containing directory is watched, so atomic replace-by-rename works
//! - A rewrite that fails to parse is logged and ignored; the last good
//!   listing stays authoritative
//! - Events are the diff against the last good listing, so a rewrite that
//!   changes nothing emits nothing

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::routing::{ChannelDefinition, ChannelRef};
use crate::watch::store::{ChannelStore, EventFeed, StoreError, WatchEvent};

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    channels: Vec<ChannelDefinition>,
}

type Listing = BTreeMap<ChannelRef, ChannelDefinition>;

/// Parse manifest text into channel definitions.
pub fn parse_manifest(content: &str) -> Result<Vec<ChannelDefinition>, StoreError> {
    let manifest: Manifest = toml::from_str(content)?;
    Ok(manifest.channels)
}

fn load_listing(path: &Path) -> Result<Listing, StoreError> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_manifest(&content)?
        .into_iter()
        .map(|def| (def.channel_ref(), def))
        .collect())
}

/// Events that turn `prev` into `next`.
pub fn diff(prev: &Listing, next: &Listing) -> Vec<WatchEvent> {
    let mut events = Vec::new();

    for (key, def) in next {
        match prev.get(key) {
            None => events.push(WatchEvent::Added(def.clone())),
            Some(old) if old != def => events.push(WatchEvent::Updated(def.clone())),
            Some(_) => {}
        }
    }
    for key in prev.keys() {
        if !next.contains_key(key) {
            events.push(WatchEvent::Deleted(key.clone()));
        }
    }

    events
}

/// Channel store backed by a manifest file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChannelStore for FileStore {
    fn list(&self) -> impl Future<Output = Result<Vec<ChannelDefinition>, StoreError>> + Send {
        let path = self.path.clone();
        async move {
            let content = tokio::fs::read_to_string(&path).await?;
            parse_manifest(&content)
        }
    }

    fn watch(&self) -> Result<EventFeed, StoreError> {
        let known = Mutex::new(load_listing(&self.path)?);
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()) {
                        return;
                    }
                    let next = match load_listing(&path) {
                        Ok(next) => next,
                        Err(e) => {
                            tracing::error!(path = ?path, error = %e, "Failed to reload channel manifest, keeping last listing");
                            return;
                        }
                    };
                    let mut known = known.lock().expect("manifest listing mutex poisoned");
                    for event in diff(&known, &next) {
                        let _ = tx.send(event);
                    }
                    *known = next;
                }
                Err(e) => tracing::error!("Channel manifest watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, "Watching channel manifest");

        Ok(EventFeed::with_guard(rx, watcher))
    }
}
