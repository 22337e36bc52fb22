//! Channel reconciliation controller.

use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::lifecycle::StopListener;
use crate::reconciler::{Controller, ControllerError};
use crate::routing::{ChannelDefinition, ChannelRef, RoutingTable, SwappableHandler};
use crate::watch::{EventStream, WatchEvent};

/// Keeps the routing table in step with the channel store.
pub struct ReconciliationController {
    events: EventStream,
    handler: SwappableHandler,
    channels: BTreeMap<ChannelRef, ChannelDefinition>,
}

impl ReconciliationController {
    pub fn new(events: EventStream, handler: SwappableHandler) -> Self {
        Self {
            events,
            handler,
            channels: BTreeMap::new(),
        }
    }

    /// Fold one event into the known channels and publish the resulting table.
    ///
    /// If the resulting channel set cannot form a table, the previously
    /// published table stays in effect.
    pub fn reconcile(&mut self, event: WatchEvent) {
        self.fold(event);
        self.publish();
    }

    fn fold(&mut self, event: WatchEvent) {
        let channel = event.channel_ref();
        tracing::debug!(kind = event.kind(), channel = %channel, "Reconciling");

        match event {
            WatchEvent::Added(def) | WatchEvent::Updated(def) => {
                self.channels.insert(channel, def);
            }
            WatchEvent::Deleted(_) => {
                self.channels.remove(&channel);
            }
        }
    }

    /// Fold every event already queued without waiting; returns how many.
    fn fold_queued(&mut self) -> usize {
        let mut folded = 0;
        while let Ok(event) = self.events.try_recv() {
            self.fold(event);
            folded += 1;
        }
        folded
    }

    fn publish(&mut self) {
        match RoutingTable::from_channels(self.channels.values()) {
            Ok(table) => {
                self.handler.set(table);
            }
            Err(e) => {
                tracing::error!(error = %e, "Rejected routing table, keeping previous one");
            }
        }
    }

    async fn run_loop(mut self, mut stop: StopListener) -> Result<(), ControllerError> {
        tracing::info!("Channel reconciler started");
        loop {
            tokio::select! {
                biased;
                _ = stop.wait() => break,
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.fold(event);
                        self.fold_queued();
                        self.publish();
                    }
                    None => {
                        if stop.is_stopped() {
                            break;
                        }
                        return Err(ControllerError::StreamClosed);
                    }
                },
            }
        }
        tracing::info!(channels = self.channels.len(), "Channel reconciler stopped");
        Ok(())
    }
}

impl Controller for ReconciliationController {
    fn name(&self) -> &'static str {
        "channel-reconciler"
    }

    fn prime(&mut self) -> Result<(), ControllerError> {
        let events = self.fold_queued();
        if events > 0 {
            self.publish();
        }
        tracing::info!(events, channels = self.channels.len(), "Initial routing table published");
        Ok(())
    }

    fn run(self: Box<Self>, stop: StopListener) -> BoxFuture<'static, Result<(), ControllerError>> {
        (*self).run_loop(stop).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::StopSignal;
    use crate::routing::Subscriber;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn def(name: &str, host: &str, subscribers: &[&str]) -> ChannelDefinition {
        ChannelDefinition {
            namespace: "default".into(),
            name: name.into(),
            hostname: Some(host.into()),
            ready: true,
            subscribers: subscribers
                .iter()
                .map(|s| Subscriber::new(s.parse().unwrap()))
                .collect(),
        }
    }

    fn controller() -> (ReconciliationController, mpsc::UnboundedSender<WatchEvent>, SwappableHandler) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = SwappableHandler::new_empty();
        (ReconciliationController::new(rx, handler.clone()), tx, handler)
    }

    #[test]
    fn test_added_twice_is_idempotent() {
        let event = WatchEvent::Added(def("a", "a.default.svc", &["http://one/"]));

        let (mut once, _tx1, handler_once) = controller();
        once.reconcile(event.clone());

        let (mut twice, _tx2, handler_twice) = controller();
        twice.reconcile(event.clone());
        twice.reconcile(event);

        assert_eq!(*handler_once.get(), *handler_twice.get());
        assert_eq!(handler_twice.get().len(), 1);
    }

    #[test]
    fn test_update_replaces_subscribers() {
        let (mut ctrl, _tx, handler) = controller();
        ctrl.reconcile(WatchEvent::Added(def("a", "a.default.svc", &["http://one/"])));
        ctrl.reconcile(WatchEvent::Updated(def("a", "a.default.svc", &["http://one/", "http://two/"])));

        let route = handler.get().lookup("a.default.svc").unwrap();
        let targets: Vec<_> = route.subscribers.iter().map(|s| s.subscriber_uri.as_str()).collect();
        assert_eq!(targets, vec!["http://one/", "http://two/"]);
    }

    #[test]
    fn test_delete_removes_route() {
        let (mut ctrl, _tx, handler) = controller();
        ctrl.reconcile(WatchEvent::Added(def("a", "a.default.svc", &[])));
        ctrl.reconcile(WatchEvent::Deleted(ChannelRef::new("default", "a")));
        assert!(handler.get().lookup("a.default.svc").is_none());

        // Deleting again is harmless.
        ctrl.reconcile(WatchEvent::Deleted(ChannelRef::new("default", "a")));
        assert!(handler.get().is_empty());
    }

    #[test]
    fn test_host_conflict_keeps_previous_table() {
        let (mut ctrl, _tx, handler) = controller();
        ctrl.reconcile(WatchEvent::Added(def("a", "shared.default.svc", &["http://one/"])));
        let before = handler.snapshot();

        ctrl.reconcile(WatchEvent::Added(def("b", "shared.default.svc", &["http://two/"])));
        let after = handler.snapshot();

        assert_eq!(before.version, after.version);
        assert_eq!(
            after.table.lookup("shared.default.svc").unwrap().channel,
            ChannelRef::new("default", "a")
        );
    }

    #[test]
    fn test_prime_publishes_queued_listing_once() {
        let (mut ctrl, tx, handler) = controller();
        for i in 0..50 {
            let name = format!("ch-{i}");
            tx.send(WatchEvent::Added(def(&name, &format!("{name}.default.svc"), &[])))
                .unwrap();
        }

        ctrl.prime().unwrap();

        let snapshot = handler.snapshot();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.table.len(), 50);
        assert!(snapshot.table.lookup("ch-49.default.svc").is_some());
    }

    #[test]
    fn test_prime_with_nothing_queued_leaves_table_alone() {
        let (mut ctrl, _tx, handler) = controller();
        ctrl.prime().unwrap();
        assert_eq!(handler.snapshot().version, 0);
    }

    #[tokio::test]
    async fn test_burst_is_published_as_one_table() {
        let (ctrl, tx, handler) = controller();
        for name in ["a", "b", "c"] {
            tx.send(WatchEvent::Added(def(name, &format!("{name}.default.svc"), &[])))
                .unwrap();
        }
        let stop = StopSignal::new();
        let task = tokio::spawn(Box::new(ctrl).run(stop.listener()));

        tokio::time::timeout(Duration::from_secs(1), async {
            while handler.get().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handler.snapshot().version, 1);

        stop.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_exits_on_stop() {
        let (ctrl, tx, handler) = controller();
        let stop = StopSignal::new();
        let task = tokio::spawn(Box::new(ctrl).run(stop.listener()));

        tx.send(WatchEvent::Added(def("a", "a.default.svc", &[]))).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while handler.get().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        stop.trigger();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        // The last published table remains in effect.
        assert_eq!(handler.get().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_stream_before_stop_is_an_error() {
        let (ctrl, tx, _handler) = controller();
        let stop = StopSignal::new();
        drop(tx);

        let result = Box::new(ctrl).run(stop.listener()).await;
        assert!(matches!(result, Err(ControllerError::StreamClosed)));
    }
}
