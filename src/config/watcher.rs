//! Dynamic configuration watcher.
//!
//! Observers are registered per file with [`ConfigWatcher::watch`]. On
//! [`ConfigWatcher::start`] every watched file is loaded and applied once;
//! after that, changes are picked up by a `notify` watcher on the containing
//! directories and re-applied from the notify thread.
//!
//! Whole directories are watched because mounted config volumes are updated
//! by swapping a symlink, which never shows up as an event on the file itself.
//! Unchanged content is not re-applied.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;

pub type ObserverResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback applying new file content to the running process.
pub type Observer = Box<dyn Fn(&str) -> ObserverResult + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConfigWatchError {
    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to apply initial {path}: {source}")]
    Apply {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to watch config: {0}")]
    Notify(#[from] notify::Error),
}

struct WatchedFile {
    path: PathBuf,
    observers: Vec<Observer>,
    last: Mutex<Option<String>>,
}

impl WatchedFile {
    fn apply(&self, content: &str) -> ObserverResult {
        for observer in &self.observers {
            observer(content)?;
        }
        Ok(())
    }

    fn reload(&self) {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Failed to read config, keeping current configuration");
                return;
            }
        };

        let mut last = self.last.lock().expect("config watcher mutex poisoned");
        if last.as_deref() == Some(content.as_str()) {
            return;
        }

        tracing::info!(path = ?self.path, "Config change detected, applying");
        for observer in &self.observers {
            if let Err(e) = observer(&content) {
                tracing::error!(path = ?self.path, error = %e, "Failed to apply config update, keeping current configuration");
            }
        }
        *last = Some(content);
    }
}

/// Watches configuration files and applies changes in place.
#[derive(Default)]
pub struct ConfigWatcher {
    files: Vec<WatchedFile>,
}

impl ConfigWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` for the file at `path`.
    pub fn watch(&mut self, path: impl AsRef<Path>, observer: Observer) {
        let path = path.as_ref().to_path_buf();
        match self.files.iter_mut().find(|f| f.path == path) {
            Some(file) => file.observers.push(observer),
            None => self.files.push(WatchedFile {
                path,
                observers: vec![observer],
                last: Mutex::new(None),
            }),
        }
    }

    pub fn watched_paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }

    /// Apply every watched file once, then start watching for changes.
    ///
    /// Any failure here is fatal to startup. Watching stops when the
    /// returned guard is dropped.
    pub fn start(self) -> Result<ConfigWatcherGuard, ConfigWatchError> {
        for file in &self.files {
            let content = std::fs::read_to_string(&file.path).map_err(|source| ConfigWatchError::Load {
                path: file.path.clone(),
                source,
            })?;
            file.apply(&content).map_err(|source| ConfigWatchError::Apply {
                path: file.path.clone(),
                source,
            })?;
            *file.last.lock().expect("config watcher mutex poisoned") = Some(content);
        }

        let files = Arc::new(self.files);
        let dirs: BTreeSet<PathBuf> = files
            .iter()
            .map(|f| match f.path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            })
            .collect();

        let handler_files = files.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        reload_all(&handler_files);
                    }
                }
                Err(e) => tracing::error!("Config watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for dir in &dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }

        tracing::info!(files = files.len(), "Config watcher started");
        Ok(ConfigWatcherGuard {
            _watcher: watcher,
            files,
        })
    }
}

fn reload_all(files: &[WatchedFile]) {
    for file in files {
        file.reload();
    }
}

/// Keeps the config watcher alive.
pub struct ConfigWatcherGuard {
    _watcher: RecommendedWatcher,
    files: Arc<Vec<WatchedFile>>,
}

impl ConfigWatcherGuard {
    /// Re-read every watched file and apply those that changed.
    pub fn reload_all(&self) {
        reload_all(&self.files);
    }
}
