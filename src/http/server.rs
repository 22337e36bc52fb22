//! Dispatcher HTTP service.
//!
//! # Responsibilities
//! - Create the Axum Router with the dispatch handler and middleware
//! - Resolve each request's channel against the current routing snapshot
//! - Enforce per-request read and write budgets
//! - Serve until told to stop, then drain in-flight requests
//!
//! # Design Decisions
//! - `start` returning does not stop serving; only `stop` does. The
//!   orchestrator calls `stop` after controllers drained, so traffic keeps
//!   flowing against the last published table until the very end
//! - Misuse of the start/stop sequence is a bug and panics
//! - Every stage of a request is time-bounded: header read, body read,
//!   delivery, and the whole request. Draining waits at most one request
//!   budget before open connections are closed

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use futures_util::StreamExt;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::{conn::auto, graceful::GracefulShutdown},
    service::TowerToHyperService,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::{MakeSpan, TraceLayer},
};
use tracing::Span;

use crate::config::DispatcherConfig;
use crate::http::delivery::{Delivery, DeliveryError, Message};
use crate::lifecycle::StopListener;
use crate::observability::{metrics, SamplingPolicy};
use crate::routing::matcher::{channel_host, MalformedRequest};
use crate::routing::SwappableHandler;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
}

/// Everything the dispatcher needs to serve.
#[derive(Clone)]
pub struct DispatcherArgs {
    pub bind_address: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_body_bytes: usize,
    pub handler: SwappableHandler,
    pub delivery: Arc<dyn Delivery>,
    pub sampling: SamplingPolicy,
}

impl DispatcherArgs {
    pub fn from_config(
        config: &DispatcherConfig,
        handler: SwappableHandler,
        delivery: Arc<dyn Delivery>,
        sampling: SamplingPolicy,
    ) -> Self {
        Self {
            bind_address: config.listener.bind_address.clone(),
            read_timeout: config.timeouts.read(),
            write_timeout: config.timeouts.write(),
            max_body_bytes: config.listener.max_body_bytes,
            handler,
            delivery,
            sampling,
        }
    }
}

/// Application state injected into the handler.
#[derive(Clone)]
struct DispatchState {
    handler: SwappableHandler,
    delivery: Arc<dyn Delivery>,
    read_timeout: Duration,
    write_timeout: Duration,
    max_body_bytes: usize,
}

enum ServiceState {
    Idle,
    Binding,
    Serving {
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    Stopped,
}

/// HTTP service that dispatches channel messages.
pub struct DispatcherService {
    bind_address: String,
    router: Router,
    read_timeout: Duration,
    /// Longest a single request may take; also the drain grace period.
    request_budget: Duration,
    state: Mutex<ServiceState>,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl DispatcherService {
    pub fn new(args: DispatcherArgs) -> Self {
        let request_budget = args.read_timeout + args.write_timeout;
        let state = DispatchState {
            handler: args.handler,
            delivery: args.delivery,
            read_timeout: args.read_timeout,
            write_timeout: args.write_timeout,
            max_body_bytes: args.max_body_bytes,
        };
        let (bound, _) = watch::channel(None);

        Self {
            bind_address: args.bind_address,
            router: Self::build_router(state, args.sampling, request_budget),
            read_timeout: args.read_timeout,
            request_budget,
            state: Mutex::new(ServiceState::Idle),
            bound,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(state: DispatchState, sampling: SamplingPolicy, request_budget: Duration) -> Router {
        Router::new()
            .fallback(dispatch_handler)
            .with_state(state)
            .layer(TimeoutLayer::new(request_budget))
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(TraceLayer::new_for_http().make_span_with(SampledSpan { policy: sampling })),
            )
    }

    /// The router serving requests, for driving the service without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().expect("dispatcher state mutex poisoned")
    }

    /// Bind the endpoint and start serving; returns once `stop` fires.
    ///
    /// Serving continues after this returns, until [`stop`](Self::stop).
    ///
    /// # Panics
    /// If the service was already started.
    pub async fn start(&self, mut stop: StopListener) -> Result<(), DispatchError> {
        {
            let mut state = self.lock_state();
            assert!(
                matches!(*state, ServiceState::Idle),
                "dispatcher service started twice"
            );
            *state = ServiceState::Binding;
        }

        let bound = match TcpListener::bind(&self.bind_address).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                *self.lock_state() = ServiceState::Idle;
                return Err(DispatchError::Bind {
                    address: self.bind_address.clone(),
                    source,
                });
            }
        };

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(
            listener,
            self.router.clone(),
            self.read_timeout,
            self.request_budget,
            shutdown_rx,
        ));

        *self.lock_state() = ServiceState::Serving { shutdown, task };
        self.bound.send_replace(Some(addr));
        tracing::info!(address = %addr, "Dispatcher listening");

        stop.wait().await;
        Ok(())
    }

    /// Stop accepting, let in-flight requests finish, then return.
    ///
    /// # Panics
    /// If the service was never started or was already stopped.
    pub async fn stop(&self) {
        let state = std::mem::replace(&mut *self.lock_state(), ServiceState::Stopped);
        match state {
            ServiceState::Serving { shutdown, task } => {
                tracing::info!("Dispatcher draining");
                let _ = shutdown.send(());
                match task.await {
                    Ok(()) => tracing::info!("Dispatcher stopped"),
                    Err(e) => tracing::error!(error = %e, "Dispatcher server task failed"),
                }
            }
            ServiceState::Idle | ServiceState::Binding => {
                panic!("dispatcher service stopped before it was started")
            }
            ServiceState::Stopped => panic!("dispatcher service stopped twice"),
        }
    }

    /// Whether the service is currently serving.
    pub fn is_serving(&self) -> bool {
        matches!(*self.lock_state(), ServiceState::Serving { .. })
    }

    /// Address the service bound to, once bound.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.borrow()
    }

    /// Wait until the service is bound and return its address.
    pub async fn wait_bound(&self) -> SocketAddr {
        let mut rx = self.bound.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(addr) = current {
                return addr;
            }
            // The sender lives as long as `self`.
            let _ = rx.changed().await;
        }
    }
}

/// Accept loop. On shutdown, stops accepting and gives open connections
/// `grace` to finish before closing them.
async fn serve(
    listener: TcpListener,
    app: Router,
    read_timeout: Duration,
    grace: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout);

    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let service = TowerToHyperService::new(app.clone());
                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                let conn = graceful.watch(conn.into_owned());
                connections.spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                    }
                });
            }
            Some(_) = connections.join_next() => {}
        }
    }

    drop(listener);
    tracing::debug!(open = connections.len(), "Closing listener, draining connections");
    if tokio::time::timeout(grace, graceful.shutdown()).await.is_err() {
        tracing::warn!(
            open = connections.len(),
            grace = ?grace,
            "Connections still open after grace period, closing"
        );
    }
    connections.abort_all();
}

/// Opens a request span only for sampled requests.
#[derive(Clone)]
struct SampledSpan {
    policy: SamplingPolicy,
}

impl<B> MakeSpan<B> for SampledSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        if !self.policy.should_sample() {
            return Span::none();
        }
        tracing::info_span!(
            "dispatch",
            method = %request.method(),
            host = ?request.headers().get(header::HOST),
            request_id = ?request.headers().get("x-request-id"),
        )
    }
}

/// Result of handling one request.
#[derive(Debug)]
enum Outcome {
    Accepted,
    MethodNotAllowed,
    Malformed(MalformedRequest),
    NoRoute(String),
    BodyTooLarge,
    BadBody,
    ReadTimeout,
    WriteTimeout,
    DeliveryFailed(DeliveryError),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::MethodNotAllowed => "method_not_allowed",
            Outcome::Malformed(_) => "malformed",
            Outcome::NoRoute(_) => "no_route",
            Outcome::BodyTooLarge => "body_too_large",
            Outcome::BadBody => "bad_body",
            Outcome::ReadTimeout => "read_timeout",
            Outcome::WriteTimeout => "write_timeout",
            Outcome::DeliveryFailed(_) => "delivery_failed",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Outcome::Accepted => StatusCode::ACCEPTED,
            Outcome::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Outcome::Malformed(_) | Outcome::BadBody => StatusCode::BAD_REQUEST,
            Outcome::NoRoute(_) => StatusCode::NOT_FOUND,
            Outcome::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Outcome::ReadTimeout => StatusCode::REQUEST_TIMEOUT,
            Outcome::WriteTimeout => StatusCode::GATEWAY_TIMEOUT,
            Outcome::DeliveryFailed(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn message(&self) -> String {
        match self {
            Outcome::Accepted => String::new(),
            Outcome::MethodNotAllowed => "Only POST is accepted".to_string(),
            Outcome::Malformed(e) => format!("Malformed request: {e}"),
            Outcome::NoRoute(host) => format!("No route for channel host {host}"),
            Outcome::BodyTooLarge => "Message body too large".to_string(),
            Outcome::BadBody => "Message body could not be read".to_string(),
            Outcome::ReadTimeout => "Timed out reading message body".to_string(),
            Outcome::WriteTimeout => "Timed out delivering message".to_string(),
            Outcome::DeliveryFailed(e) => format!("Delivery failed: {e}"),
        }
    }
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        (self.status(), self.message()).into_response()
    }
}

/// Main dispatch handler.
/// Resolves the channel, reads the body, and hands the message to delivery.
async fn dispatch_handler(State(state): State<DispatchState>, request: Request<Body>) -> Response {
    let start_time = Instant::now();
    let outcome = dispatch(&state, request).await;

    match &outcome {
        Outcome::Accepted => tracing::debug!("Message accepted"),
        Outcome::DeliveryFailed(_) | Outcome::WriteTimeout => {
            tracing::warn!(outcome = outcome.label(), "Message not delivered")
        }
        other => tracing::debug!(outcome = other.label(), "Request rejected"),
    }
    metrics::record_request(outcome.label(), start_time);
    outcome.into_response()
}

async fn dispatch(state: &DispatchState, request: Request<Body>) -> Outcome {
    if request.method() != Method::POST {
        return Outcome::MethodNotAllowed;
    }

    let host = match channel_host(&request) {
        Ok(host) => host,
        Err(e) => return Outcome::Malformed(e),
    };

    // One snapshot per request.
    let table = state.handler.get();
    let Some(route) = table.lookup(&host) else {
        tracing::debug!(host = %host, "No route matched");
        return Outcome::NoRoute(host);
    };

    let declared_len = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > state.max_body_bytes) {
        return Outcome::BodyTooLarge;
    }

    let (parts, body) = request.into_parts();
    let body = match tokio::time::timeout(state.read_timeout, read_body(body, state.max_body_bytes)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(outcome)) => return outcome,
        Err(_) => return Outcome::ReadTimeout,
    };

    tracing::debug!(channel = %route.channel, subscribers = route.subscribers.len(), "Dispatching message");
    let message = Message::from_parts(&parts.headers, body);
    match tokio::time::timeout(state.write_timeout, state.delivery.deliver(route, message)).await {
        Ok(Ok(())) => Outcome::Accepted,
        Ok(Err(e)) => Outcome::DeliveryFailed(e),
        Err(_) => Outcome::WriteTimeout,
    }
}

/// Buffer the body, rejecting it as soon as it grows past `limit`.
async fn read_body(body: Body, limit: usize) -> Result<Bytes, Outcome> {
    let mut frames = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(frame) = frames.next().await {
        let chunk = frame.map_err(|_| Outcome::BadBody)?;
        if buf.len() + chunk.len() > limit {
            return Err(Outcome::BodyTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}
