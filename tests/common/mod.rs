//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

use channel_dispatcher::config::DispatcherConfig;
use channel_dispatcher::routing::{ChannelDefinition, Subscriber};

/// A subscriber endpoint that records every body it receives.
pub struct Sink {
    pub url: Url,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Sink {
    /// Next received body; panics after five seconds.
    pub async fn next(&mut self) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("sink timed out")
            .expect("sink closed")
    }

    pub fn try_next(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

/// Start a subscriber on an ephemeral port.
pub async fn start_sink() -> Sink {
    start_replying_sink("").await
}

/// Start a subscriber that answers every message with `reply`.
pub async fn start_replying_sink(reply: &'static str) -> Sink {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    let app = Router::new().fallback(move |body: Bytes| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(body);
            (StatusCode::OK, reply)
        }
    });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Sink {
        url: format!("http://{addr}/").parse().unwrap(),
        rx,
    }
}

/// A ready channel in `default` reachable at `<name>.default.svc`.
pub fn channel(name: &str, subscribers: &[&Url]) -> ChannelDefinition {
    ChannelDefinition {
        namespace: "default".into(),
        name: name.into(),
        hostname: Some(format!("{name}.default.svc")),
        ready: true,
        subscribers: subscribers.iter().map(|u| Subscriber::new((*u).clone())).collect(),
    }
}

/// Default config bound to an ephemeral local port.
pub fn test_config() -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.timeouts.read_secs = 5;
    config.timeouts.write_secs = 5;
    config
}

/// POST `body` to the dispatcher addressed to channel `host`.
pub async fn post(addr: SocketAddr, host: &str, body: &'static str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .header("Host", host)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap()
}

/// Poll `cond` until it holds; panics after five seconds.
pub async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `fut`, panicking after five seconds.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}
