//! End-to-end lifecycle tests: startup ordering, live routing updates and
//! shutdown ordering against real sockets.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use channel_dispatcher::config::watcher::ObserverResult;
use channel_dispatcher::config::ConfigWatcher;
use channel_dispatcher::http::{DispatcherArgs, DispatcherService, HttpFanout};
use channel_dispatcher::lifecycle::{LifecycleError, LifecycleOrchestrator, Phase, StopListener, StopSignal};
use channel_dispatcher::observability::SamplingPolicy;
use channel_dispatcher::reconciler::{Controller, ControllerError, ReconciliationController};
use channel_dispatcher::routing::{ChannelRef, SwappableHandler};
use channel_dispatcher::watch::{FileStore, MemoryStore, WatchCoordinator, WatchError, WatchEvent};

mod common;
use common::{channel, post, start_sink, test_config, wait_until, within};

/// Waits for stop, lingers, then records whether the dispatcher still serves.
struct SlowController {
    delay: Duration,
    dispatcher: Arc<OnceLock<Arc<DispatcherService>>>,
    observed: Arc<Mutex<Option<bool>>>,
}

impl Controller for SlowController {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn run(self: Box<Self>, mut stop: StopListener) -> BoxFuture<'static, Result<(), ControllerError>> {
        async move {
            stop.wait().await;
            tokio::time::sleep(self.delay).await;
            let serving = self.dispatcher.get().map(|d| d.is_serving());
            *self.observed.lock().unwrap() = serving;
            Ok(())
        }
        .boxed()
    }
}

/// Never observes stop.
struct StuckController;

impl Controller for StuckController {
    fn name(&self) -> &'static str {
        "stuck"
    }

    fn run(self: Box<Self>, _stop: StopListener) -> BoxFuture<'static, Result<(), ControllerError>> {
        std::future::pending().boxed()
    }
}

/// Fails as soon as it runs.
struct FailingController;

impl Controller for FailingController {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn run(self: Box<Self>, _stop: StopListener) -> BoxFuture<'static, Result<(), ControllerError>> {
        async { Err(ControllerError::Failed("boom".into())) }.boxed()
    }
}

/// Orchestrator with the channel reconciler plus `extra` controllers.
fn assemble_with(
    store: MemoryStore,
    extra: Vec<Box<dyn Controller>>,
) -> Result<LifecycleOrchestrator<MemoryStore>, LifecycleError> {
    let config = test_config();
    let handler = SwappableHandler::new_empty();
    let dispatcher = DispatcherService::new(DispatcherArgs::from_config(
        &config,
        handler.clone(),
        Arc::new(HttpFanout::new()),
        SamplingPolicy::disabled(),
    ));
    let (watch, events) = WatchCoordinator::new(store);

    let mut controllers: Vec<Box<dyn Controller>> =
        vec![Box::new(ReconciliationController::new(events, handler.clone()))];
    let declared = 1 + extra.len();
    controllers.extend(extra);

    LifecycleOrchestrator::assemble(handler, dispatcher, watch, controllers, declared)
}

#[tokio::test]
async fn test_channel_add_update_delete() {
    let mut first = start_sink().await;
    let mut second = start_sink().await;
    let store = MemoryStore::with_channels(vec![channel("a", &[&first.url])]);

    let orchestrator = LifecycleOrchestrator::new(
        &test_config(),
        store.clone(),
        Arc::new(HttpFanout::new()),
        SamplingPolicy::disabled(),
    )
    .unwrap();
    let handler = orchestrator.handler().clone();
    let dispatcher = orchestrator.dispatcher();
    let stop = StopSignal::new();
    let run = tokio::spawn(orchestrator.run(stop.clone()));

    let addr = within(dispatcher.wait_bound()).await;

    let res = post(addr, "a.default.svc", r#"{"n":1}"#).await;
    assert_eq!(res.status(), reqwest::StatusCode::ACCEPTED);
    assert_eq!(first.next().await, r#"{"n":1}"#);

    store.apply(WatchEvent::Updated(channel("a", &[&first.url, &second.url])));
    wait_until(|| {
        handler
            .get()
            .lookup("a.default.svc")
            .is_some_and(|r| r.subscribers.len() == 2)
    })
    .await;

    let res = post(addr, "a.default.svc", r#"{"n":2}"#).await;
    assert_eq!(res.status(), reqwest::StatusCode::ACCEPTED);
    assert_eq!(first.next().await, r#"{"n":2}"#);
    assert_eq!(second.next().await, r#"{"n":2}"#);

    store.apply(WatchEvent::Deleted(ChannelRef::new("default", "a")));
    wait_until(|| handler.get().lookup("a.default.svc").is_none()).await;

    let res = post(addr, "a.default.svc", r#"{"n":3}"#).await;
    assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);
    assert!(first.try_next().is_none());

    stop.trigger();
    within(run).await.unwrap().unwrap();
    assert!(!dispatcher.is_serving());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initial_listing_routable_when_dispatcher_binds() {
    let channels: Vec<_> = (0..500).map(|i| channel(&format!("ch-{i}"), &[])).collect();
    let orchestrator = LifecycleOrchestrator::new(
        &test_config(),
        MemoryStore::with_channels(channels),
        Arc::new(HttpFanout::new()),
        SamplingPolicy::disabled(),
    )
    .unwrap();
    let handler = orchestrator.handler().clone();
    let dispatcher = orchestrator.dispatcher();
    let stop = StopSignal::new();
    let run = tokio::spawn(orchestrator.run(stop.clone()));

    let addr = within(dispatcher.wait_bound()).await;
    let snapshot = handler.snapshot();
    assert_eq!(snapshot.table.len(), 500);
    // The whole listing lands in a single publish.
    assert_eq!(snapshot.version, 1);

    let res = post(addr, "ch-499.default.svc", "{}").await;
    assert_eq!(res.status(), reqwest::StatusCode::ACCEPTED);

    stop.trigger();
    within(run).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_during_stalled_listing_joins_watch() {
    let store = MemoryStore::new();
    store.stall_listing();
    let orchestrator = assemble_with(store, Vec::new()).unwrap();
    let dispatcher = orchestrator.dispatcher();
    let mut phases = orchestrator.phases();
    let stop = StopSignal::new();
    let run = tokio::spawn(orchestrator.run(stop.clone()));

    within(phases.wait_for(|p| *p == Phase::WaitingForSync)).await.unwrap();
    stop.trigger();

    within(run).await.unwrap().unwrap();
    assert!(dispatcher.bound_addr().is_none());
    assert_eq!(*phases.borrow(), Phase::Stopped);
}

#[tokio::test]
async fn test_phases_reach_stopped() {
    let orchestrator = assemble_with(MemoryStore::new(), Vec::new()).unwrap();
    let mut phases = orchestrator.phases();
    assert_eq!(*phases.borrow(), Phase::Constructing);

    let stop = StopSignal::new();
    let run = tokio::spawn(orchestrator.run(stop.clone()));

    within(phases.wait_for(|p| *p == Phase::Running)).await.unwrap();
    stop.trigger();
    within(run).await.unwrap().unwrap();
    assert_eq!(*phases.borrow(), Phase::Stopped);
}

#[tokio::test]
async fn test_dispatcher_outlives_controller_drain() {
    let dispatcher_slot = Arc::new(OnceLock::new());
    let observed = Arc::new(Mutex::new(None));
    let slow = SlowController {
        delay: Duration::from_millis(200),
        dispatcher: dispatcher_slot.clone(),
        observed: observed.clone(),
    };

    let orchestrator = assemble_with(MemoryStore::new(), vec![Box::new(slow)]).unwrap();
    let dispatcher = orchestrator.dispatcher();
    assert!(dispatcher_slot.set(dispatcher.clone()).is_ok());

    let stop = StopSignal::new();
    let run = tokio::spawn(orchestrator.run(stop.clone()));
    within(dispatcher.wait_bound()).await;

    stop.trigger();
    within(run).await.unwrap().unwrap();

    assert_eq!(*observed.lock().unwrap(), Some(true));
    assert!(!dispatcher.is_serving());
}

#[tokio::test]
async fn test_controller_count_mismatch_fails_construction() {
    let config = test_config();
    let handler = SwappableHandler::new_empty();
    let dispatcher = DispatcherService::new(DispatcherArgs::from_config(
        &config,
        handler.clone(),
        Arc::new(HttpFanout::new()),
        SamplingPolicy::disabled(),
    ));
    let (watch, events) = WatchCoordinator::new(MemoryStore::new());
    let controllers: Vec<Box<dyn Controller>> =
        vec![Box::new(ReconciliationController::new(events, handler.clone()))];

    let err = LifecycleOrchestrator::assemble(handler, dispatcher, watch, controllers, 2)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        LifecycleError::ControllerCountMismatch { declared: 2, actual: 1 }
    ));
}

#[tokio::test]
async fn test_initial_listing_failure_never_serves() {
    let store = MemoryStore::new();
    store.fail_listing("store unreachable");

    let orchestrator = assemble_with(store, Vec::new()).unwrap();
    let dispatcher = orchestrator.dispatcher();
    let phases = orchestrator.phases();

    let err = within(orchestrator.run(StopSignal::new())).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Watch(WatchError::InitialList(_))));
    assert!(dispatcher.bound_addr().is_none());
    assert_eq!(*phases.borrow(), Phase::Stopped);
}

#[tokio::test]
async fn test_config_load_failure_never_serves() {
    let dir = tempfile::tempdir().unwrap();
    let mut watcher = ConfigWatcher::new();
    watcher.watch(dir.path().join("missing.toml"), Box::new(|_: &str| -> ObserverResult { Ok(()) }));

    let orchestrator = assemble_with(MemoryStore::new(), Vec::new())
        .unwrap()
        .with_config_watcher(watcher);
    let dispatcher = orchestrator.dispatcher();

    let err = within(orchestrator.run(StopSignal::new())).await.unwrap_err();
    assert!(matches!(err, LifecycleError::ConfigWatch(_)));
    assert!(dispatcher.bound_addr().is_none());
}

#[tokio::test]
async fn test_watch_stream_closing_stops_everything() {
    let store = MemoryStore::new();
    let orchestrator = assemble_with(store.clone(), Vec::new()).unwrap();
    let dispatcher = orchestrator.dispatcher();
    let stop = StopSignal::new();
    let run = tokio::spawn(orchestrator.run(stop.clone()));

    within(dispatcher.wait_bound()).await;
    store.close_feeds();

    let err = within(run).await.unwrap().unwrap_err();
    assert!(matches!(err, LifecycleError::Watch(WatchError::StreamClosed)));
    assert!(stop.is_triggered());
    assert!(!dispatcher.is_serving());
}

#[tokio::test]
async fn test_controller_failure_stops_everything() {
    let orchestrator = assemble_with(MemoryStore::new(), vec![Box::new(FailingController)]).unwrap();
    let dispatcher = orchestrator.dispatcher();
    let stop = StopSignal::new();

    let err = within(orchestrator.run(stop.clone())).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Controller { name: "failing", .. }));
    assert!(stop.is_triggered());
    assert!(!dispatcher.is_serving());
}

#[tokio::test]
async fn test_drain_deadline_aborts_stuck_controller() {
    let orchestrator = assemble_with(MemoryStore::new(), vec![Box::new(StuckController)])
        .unwrap()
        .with_drain_timeout(Some(Duration::from_millis(100)));
    let dispatcher = orchestrator.dispatcher();
    let stop = StopSignal::new();
    let run = tokio::spawn(orchestrator.run(stop.clone()));

    within(dispatcher.wait_bound()).await;
    stop.trigger();

    match within(run).await.unwrap() {
        Err(LifecycleError::DrainTimeout { stuck, .. }) => assert_eq!(stuck, vec!["stuck"]),
        other => panic!("expected drain timeout, got {other:?}"),
    }
    assert!(!dispatcher.is_serving());
}

#[tokio::test]
async fn test_file_store_end_to_end() {
    let mut sink = start_sink().await;
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("channels.toml");
    let sink_url = sink.url.clone();
    let write_manifest = |hostname: &str| {
        let content = format!(
            "[[channels]]\nnamespace = \"default\"\nname = \"orders\"\nhostname = \"{hostname}\"\n\n\
             [[channels.subscribers]]\nsubscriber_uri = \"{}\"\n",
            sink_url
        );
        std::fs::write(&manifest, content).unwrap();
    };
    write_manifest("orders.default.svc");

    let mut config = test_config();
    config.store.channels_path = manifest.to_string_lossy().into_owned();
    let orchestrator = LifecycleOrchestrator::new(
        &config,
        FileStore::new(&manifest),
        Arc::new(HttpFanout::new()),
        SamplingPolicy::disabled(),
    )
    .unwrap();
    let handler = orchestrator.handler().clone();
    let dispatcher = orchestrator.dispatcher();
    let stop = StopSignal::new();
    let run = tokio::spawn(orchestrator.run(stop.clone()));

    let addr = within(dispatcher.wait_bound()).await;
    let res = post(addr, "orders.default.svc", "{}").await;
    assert_eq!(res.status(), reqwest::StatusCode::ACCEPTED);
    assert_eq!(sink.next().await, "{}");

    write_manifest("billing.default.svc");
    wait_until(|| handler.get().lookup("billing.default.svc").is_some()).await;

    let res = post(addr, "orders.default.svc", "{}").await;
    assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);

    stop.trigger();
    within(run).await.unwrap().unwrap();
}
