//! Message delivery to channel subscribers.
//!
//! The dispatcher only resolves *where* a message goes; how it gets there
//! is behind the [`Delivery`] trait. [`HttpFanout`] is the plain
//! implementation: one POST per subscriber, concurrently, no retries.
//! A subscriber's non-empty response is forwarded to its reply address.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, Method, Request};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;
use url::Url;

use crate::routing::{ChannelRoute, Subscriber};

/// A message accepted on a channel.
#[derive(Debug, Clone)]
pub struct Message {
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Message {
    /// Keep only the headers that describe the message itself.
    pub fn from_parts(headers: &HeaderMap, body: Bytes) -> Self {
        let mut kept = HeaderMap::new();
        for (name, value) in headers {
            if is_message_header(name) {
                kept.append(name.clone(), value.clone());
            }
        }
        Self { headers: kept, body }
    }
}

fn is_message_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name == header::CONTENT_TYPE.as_str() || name == "x-request-id" || name.starts_with("ce-")
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{failed} of {total} subscribers failed")]
    Subscribers { failed: usize, total: usize },
}

/// Delivers a message to every subscriber of a route.
pub trait Delivery: Send + Sync + 'static {
    fn deliver(&self, route: Arc<ChannelRoute>, message: Message) -> BoxFuture<'static, Result<(), DeliveryError>>;
}

/// Concurrent HTTP POST to each subscriber.
#[derive(Clone)]
pub struct HttpFanout {
    client: Client<HttpConnector, Body>,
}

impl HttpFanout {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }
}

impl Default for HttpFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl Delivery for HttpFanout {
    fn deliver(&self, route: Arc<ChannelRoute>, message: Message) -> BoxFuture<'static, Result<(), DeliveryError>> {
        let client = self.client.clone();
        async move {
            let total = route.subscribers.len();
            let sends = route
                .subscribers
                .iter()
                .map(|s| deliver_one(&client, s, &message));
            let results = join_all(sends).await;

            let mut failed = 0;
            for (subscriber, result) in route.subscribers.iter().zip(results) {
                if let Err(e) = result {
                    failed += 1;
                    tracing::warn!(
                        channel = %route.channel,
                        subscriber = %subscriber.subscriber_uri,
                        error = %e,
                        "Delivery to subscriber failed"
                    );
                }
            }

            if failed > 0 {
                Err(DeliveryError::Subscribers { failed, total })
            } else {
                Ok(())
            }
        }
        .boxed()
    }
}

/// Largest subscriber response that is forwarded as a reply.
const MAX_REPLY_BYTES: usize = 4 * 1024 * 1024;

async fn deliver_one(
    client: &Client<HttpConnector, Body>,
    subscriber: &Subscriber,
    message: &Message,
) -> Result<(), String> {
    let reply = send_one(client, &subscriber.subscriber_uri, message).await?;
    match (&subscriber.reply_uri, reply) {
        (Some(reply_uri), Some(reply)) => send_one(client, reply_uri, &reply)
            .await
            .map(|_| ())
            .map_err(|e| format!("reply to {reply_uri}: {e}")),
        _ => Ok(()),
    }
}

/// POST `message` to `target`; returns the response as a message if it has a body.
async fn send_one(
    client: &Client<HttpConnector, Body>,
    target: &Url,
    message: &Message,
) -> Result<Option<Message>, String> {
    let mut builder = Request::builder().method(Method::POST).uri(target.as_str());
    if let Some(headers) = builder.headers_mut() {
        headers.extend(message.headers.clone());
    }
    let request = builder
        .body(Body::from(message.body.clone()))
        .map_err(|e| e.to_string())?;

    let response = client.request(request).await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("responded {}", response.status()));
    }

    let (parts, body) = response.into_parts();
    let body = axum::body::to_bytes(Body::new(body), MAX_REPLY_BYTES)
        .await
        .map_err(|e| e.to_string())?;
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(Message::from_parts(&parts.headers, body)))
}
