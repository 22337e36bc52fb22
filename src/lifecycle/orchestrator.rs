//! Startup and shutdown orchestration.
//!
//! # Phases
//! ```text
//! Constructing   handler (empty) → dispatcher → watch + controllers;
//!                controller count checked against NUM_CONTROLLERS
//! WaitingForSync config watcher started, watch started, block on SyncBarrier,
//!                then every controller primes (initial table published)
//! Running        dispatcher and controllers run concurrently until stop
//! Draining       join every controller (optionally bounded)
//! Stopped        dispatcher stopped; last published table served until here
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and nothing is served
//! - Traffic only after the initial channel universe is known
//! - Any controller, watch or dispatcher failure while running stops the
//!   whole process through the same drain path

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::watcher::ConfigWatchError;
use crate::config::{ConfigWatcher, DispatcherConfig};
use crate::http::{Delivery, DispatchError, DispatcherArgs, DispatcherService};
use crate::lifecycle::StopSignal;
use crate::observability::SamplingPolicy;
use crate::reconciler::{Controller, ControllerError, ReconciliationController};
use crate::routing::SwappableHandler;
use crate::watch::{ChannelStore, SyncBarrier, WatchCoordinator, WatchError};

/// Number of controllers the dispatcher runs.
///
/// Adding a controller to [`LifecycleOrchestrator::new`] means bumping this.
pub const NUM_CONTROLLERS: usize = 1;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Constructing,
    WaitingForSync,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("controller count mismatch: declared {declared}, registered {actual}")]
    ControllerCountMismatch { declared: usize, actual: usize },

    #[error("config watcher: {0}")]
    ConfigWatch(#[from] ConfigWatchError),

    #[error("channel watch: {0}")]
    Watch(#[from] WatchError),

    #[error("dispatcher: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("dispatcher task failed: {0}")]
    DispatcherTask(String),

    #[error("controller {name} failed: {source}")]
    Controller {
        name: &'static str,
        source: ControllerError,
    },

    #[error("controller {name} panicked: {reason}")]
    ControllerPanicked { name: &'static str, reason: String },

    #[error("drain deadline {deadline:?} exceeded; stuck controllers: {stuck:?}")]
    DrainTimeout {
        deadline: Duration,
        stuck: Vec<&'static str>,
    },
}

type ControllerExit = (&'static str, std::thread::Result<Result<(), ControllerError>>);

/// Sequences the dispatcher, the channel watch and the controllers.
pub struct LifecycleOrchestrator<S: ChannelStore> {
    handler: SwappableHandler,
    dispatcher: Arc<DispatcherService>,
    watch: WatchCoordinator<S>,
    controllers: Vec<Box<dyn Controller>>,
    config_watcher: Option<ConfigWatcher>,
    drain_timeout: Option<Duration>,
    phase: watch::Sender<Phase>,
}

impl<S: ChannelStore> LifecycleOrchestrator<S> {
    /// Build the standard component set in dependency order.
    pub fn new(
        config: &DispatcherConfig,
        store: S,
        delivery: Arc<dyn Delivery>,
        sampling: SamplingPolicy,
    ) -> Result<Self, LifecycleError> {
        let handler = SwappableHandler::new_empty();
        let dispatcher = DispatcherService::new(DispatcherArgs::from_config(
            config,
            handler.clone(),
            delivery,
            sampling,
        ));
        let (watch, events) = WatchCoordinator::new(store);

        // Add new controllers here and bump NUM_CONTROLLERS to match.
        let controllers: Vec<Box<dyn Controller>> = vec![Box::new(ReconciliationController::new(
            events,
            handler.clone(),
        ))];

        Ok(Self::assemble(handler, dispatcher, watch, controllers, NUM_CONTROLLERS)?
            .with_drain_timeout(config.lifecycle.drain_timeout()))
    }

    /// Assemble an orchestrator from prebuilt parts.
    ///
    /// Fails if `controllers` does not hold exactly `declared` entries.
    pub fn assemble(
        handler: SwappableHandler,
        dispatcher: DispatcherService,
        watch: WatchCoordinator<S>,
        controllers: Vec<Box<dyn Controller>>,
        declared: usize,
    ) -> Result<Self, LifecycleError> {
        if controllers.len() != declared {
            return Err(LifecycleError::ControllerCountMismatch {
                declared,
                actual: controllers.len(),
            });
        }

        let (phase, _) = watch::channel(Phase::Constructing);
        Ok(Self {
            handler,
            dispatcher: Arc::new(dispatcher),
            watch,
            controllers,
            config_watcher: None,
            drain_timeout: None,
            phase,
        })
    }

    /// Dynamic config to start before waiting for the channel sync.
    pub fn with_config_watcher(mut self, watcher: ConfigWatcher) -> Self {
        self.config_watcher = Some(watcher);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn handler(&self) -> &SwappableHandler {
        &self.handler
    }

    pub fn dispatcher(&self) -> Arc<DispatcherService> {
        self.dispatcher.clone()
    }

    pub fn barrier(&self) -> SyncBarrier {
        self.watch.barrier()
    }

    /// Observe phase transitions.
    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: Phase) {
        tracing::info!(phase = ?phase, "Lifecycle phase");
        self.phase.send_replace(phase);
    }

    /// Run until `stop` fires and everything has drained.
    pub async fn run(mut self, stop: StopSignal) -> Result<(), LifecycleError> {
        let result = self.run_phases(&stop).await;
        self.enter(Phase::Stopped);
        result
    }

    async fn run_phases(&mut self, stop: &StopSignal) -> Result<(), LifecycleError> {
        // WaitingForSync
        self.enter(Phase::WaitingForSync);
        let _config_guard = match self.config_watcher.take() {
            Some(watcher) => Some(watcher.start()?),
            None => None,
        };

        self.watch.start(stop.listener());
        let mut stop_listener = stop.listener();
        let synced = tokio::select! {
            res = self.watch.wait_for_sync() => match res {
                Ok(()) => true,
                Err(WatchError::StoppedBeforeSync) => false,
                Err(e) => return Err(e.into()),
            },
            _ = stop_listener.wait() => false,
        };
        if !synced {
            tracing::info!("Stop requested before initial sync, not serving");
            self.watch.join().await?;
            return Ok(());
        }

        // The initial table must be in place before the first request.
        for controller in &mut self.controllers {
            let name = controller.name();
            if let Err(source) = controller.prime() {
                tracing::error!(controller = name, error = %source, "Controller failed to prime");
                stop.trigger();
                let _ = self.watch.join().await;
                return Err(LifecycleError::Controller { name, source });
            }
        }

        // Running
        self.enter(Phase::Running);
        let dispatcher = self.dispatcher.clone();
        let serve_listener = stop.listener();
        let mut serving = tokio::spawn(async move { dispatcher.start(serve_listener).await });

        let mut controllers: JoinSet<ControllerExit> = JoinSet::new();
        let mut running: Vec<&'static str> = Vec::new();
        for controller in self.controllers.drain(..) {
            let name = controller.name();
            let listener = stop.listener();
            running.push(name);
            controllers.spawn(async move {
                let outcome = AssertUnwindSafe(controller.run(listener)).catch_unwind().await;
                (name, outcome)
            });
        }
        tracing::info!(controllers = ?running, "Controllers started");

        let mut failure: Option<LifecycleError> = None;
        let mut served = None;
        let mut watch_joined = false;

        tokio::select! {
            _ = stop_listener.wait() => {}
            res = self.watch.join() => {
                watch_joined = true;
                if let Err(e) = res {
                    tracing::error!(error = %e, "Channel watch failed");
                    failure = Some(e.into());
                }
            }
            res = &mut serving => {
                served = Some(res);
            }
            Some(joined) = controllers.join_next() => {
                if let Some(e) = controller_exit(joined, &mut running, false) {
                    failure = Some(e);
                }
            }
        }
        if stop.trigger() {
            tracing::warn!("Stopping after a component exited early");
        }

        // Draining
        self.enter(Phase::Draining);
        let drain = drain_controllers(&mut controllers, &mut running);
        let drained = match self.drain_timeout {
            Some(deadline) => tokio::time::timeout(deadline, drain).await.map_err(|_| deadline),
            None => Ok(drain.await),
        };
        match drained {
            Ok(Some(e)) => {
                failure.get_or_insert(e);
            }
            Ok(None) => tracing::info!("All controllers drained"),
            Err(deadline) => {
                tracing::error!(stuck = ?running, deadline = ?deadline, "Drain deadline exceeded, aborting controllers");
                controllers.abort_all();
                failure.get_or_insert(LifecycleError::DrainTimeout {
                    deadline,
                    stuck: running.clone(),
                });
            }
        }

        if !watch_joined {
            if let Err(e) = self.watch.join().await {
                tracing::error!(error = %e, "Channel watch failed");
                // A controller whose stream closed is reporting this same failure.
                if matches!(
                    failure,
                    None | Some(LifecycleError::Controller {
                        source: ControllerError::StreamClosed,
                        ..
                    })
                ) {
                    failure = Some(e.into());
                }
            }
        }

        // Stopping the dispatcher comes strictly after the drain.
        let served = match served {
            Some(res) => res,
            None => serving.await,
        };
        match served {
            Ok(Ok(())) => self.dispatcher.stop().await,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Dispatcher failed to start");
                failure.get_or_insert(e.into());
            }
            Err(e) => {
                failure.get_or_insert(LifecycleError::DispatcherTask(e.to_string()));
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Join every remaining controller; returns the first failure.
async fn drain_controllers(
    controllers: &mut JoinSet<ControllerExit>,
    running: &mut Vec<&'static str>,
) -> Option<LifecycleError> {
    let mut failure = None;
    while let Some(joined) = controllers.join_next().await {
        if let Some(e) = controller_exit(joined, running, true) {
            failure.get_or_insert(e);
        }
    }
    failure
}

fn controller_exit(
    joined: Result<ControllerExit, tokio::task::JoinError>,
    running: &mut Vec<&'static str>,
    stopping: bool,
) -> Option<LifecycleError> {
    let (name, outcome) = match joined {
        Ok(exit) => exit,
        Err(e) => {
            tracing::error!(error = %e, "Controller task cancelled");
            return None;
        }
    };
    running.retain(|n| *n != name);

    match outcome {
        Ok(Ok(())) if stopping => {
            tracing::info!(controller = name, "Controller stopped");
            None
        }
        Ok(Ok(())) => {
            tracing::error!(controller = name, "Controller exited before stop");
            Some(LifecycleError::Controller {
                name,
                source: ControllerError::Failed("exited before stop".into()),
            })
        }
        Ok(Err(e)) => {
            tracing::error!(controller = name, error = %e, "Controller failed");
            Some(LifecycleError::Controller { name, source: e })
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(controller = name, reason = %reason, "Controller panicked");
            Some(LifecycleError::ControllerPanicked { name, reason })
        }
    }
}
