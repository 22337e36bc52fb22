//! Routing table value types.
//!
//! A [`RoutingTable`] is immutable once built. Updates never touch a
//! published table; the reconciler builds a fresh one and swaps it in.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Identity of a channel resource in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelRef {
    pub namespace: String,
    pub name: String,
}

impl ChannelRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A subscriber endpoint of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Where events are delivered.
    pub subscriber_uri: Url,

    /// Where the subscriber's reply is forwarded, if anywhere.
    #[serde(default)]
    pub reply_uri: Option<Url>,
}

impl Subscriber {
    pub fn new(subscriber_uri: Url) -> Self {
        Self {
            subscriber_uri,
            reply_uri: None,
        }
    }
}

/// Channel definition as stored in the resource store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDefinition {
    pub namespace: String,
    pub name: String,

    /// Address the channel is reachable at. Unset until the channel is provisioned.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Whether the channel reports itself ready.
    #[serde(default = "default_ready")]
    pub ready: bool,

    #[serde(default)]
    pub subscribers: Vec<Subscriber>,
}

fn default_ready() -> bool {
    true
}

impl ChannelDefinition {
    pub fn channel_ref(&self) -> ChannelRef {
        ChannelRef::new(&self.namespace, &self.name)
    }

    /// Whether this channel should appear in the routing table.
    pub fn is_routable(&self) -> bool {
        self.ready && self.hostname.as_deref().is_some_and(|h| !h.is_empty())
    }
}

/// Resolved route for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRoute {
    pub channel: ChannelRef,
    pub hostname: String,
    pub subscribers: Vec<Subscriber>,
}

/// Error building a routing table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("hostname {hostname} claimed by both {first} and {second}")]
    DuplicateHost {
        hostname: String,
        first: ChannelRef,
        second: ChannelRef,
    },
}

/// Immutable mapping from channel hostname to its route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: HashMap<String, Arc<ChannelRoute>>,
}

impl RoutingTable {
    /// The table with zero channels.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from channel definitions.
    ///
    /// Channels that are not ready or have no hostname are skipped. Two
    /// routable channels sharing a hostname is an error, since requests for
    /// that host could not be resolved unambiguously.
    pub fn from_channels<'a, I>(channels: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = &'a ChannelDefinition>,
    {
        let mut routes: HashMap<String, Arc<ChannelRoute>> = HashMap::new();

        for def in channels {
            if !def.is_routable() {
                tracing::debug!(channel = %def.channel_ref(), "Skipping channel that is not ready");
                continue;
            }
            let Some(hostname) = def.hostname.as_deref().map(normalize_host) else {
                continue;
            };

            if let Some(existing) = routes.get(&hostname) {
                return Err(TableError::DuplicateHost {
                    hostname,
                    first: existing.channel.clone(),
                    second: def.channel_ref(),
                });
            }

            routes.insert(
                hostname.clone(),
                Arc::new(ChannelRoute {
                    channel: def.channel_ref(),
                    hostname,
                    subscribers: def.subscribers.clone(),
                }),
            );
        }

        Ok(Self { routes })
    }

    /// Look up the route for a hostname.
    pub fn lookup(&self, host: &str) -> Option<Arc<ChannelRoute>> {
        self.routes.get(&normalize_host(host)).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> impl Iterator<Item = &ChannelRoute> {
        self.routes.values().map(|r| r.as_ref())
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}
