//! Client configuration.
//!
//! Every field has a default, so a partial JSON document is a valid config.
//! Durations are expressed in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hosted;

/// Which traces are raised from `trace` to `info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugFlags {
    /// Envelopes sent and replies received.
    pub broadcast: bool,
    /// Channel connect / reconnect transitions.
    pub connect: bool,
    /// Transaction lifecycle steps.
    pub tx: bool,
}

/// Configuration read by every component of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local node override. When set, hosted nodes are never contacted.
    pub local_node: Option<String>,
    /// Hosted (public fallback) nodes, in failover order.
    pub hosted_nodes: Vec<String>,
    /// Duplex socket path.
    pub ipc_path: Option<String>,
    /// Push socket URL.
    pub ws_url: Option<String>,
    /// Delay between two confirmation polls.
    pub poll_interval_ms: u64,
    /// Poll budget per transaction.
    pub max_poll_attempts: u32,
    /// How long a correlated request may wait for its reply.
    pub request_timeout_ms: u64,
    /// First reconnect delay; doubles on every failed attempt.
    pub reconnect_initial_ms: u64,
    /// Optional reconnect delay ceiling. Unset means unbounded growth.
    pub reconnect_max_ms: Option<u64>,
    pub debug: DebugFlags,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_node: None,
            hosted_nodes: hosted::public_nodes(hosted::DEFAULT_CHAIN_ID),
            ipc_path: None,
            ws_url: None,
            poll_interval_ms: 6_000,
            max_poll_attempts: 64,
            request_timeout_ms: 30_000,
            reconnect_initial_ms: 1,
            reconnect_max_ms: None,
            debug: DebugFlags::default(),
        }
    }
}

impl ClientConfig {
    /// Load from a JSON document; missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Restore every field to its default.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Hosted nodes for `chain_id` with everything else defaulted.
    pub fn for_chain(chain_id: u64) -> Self {
        Self {
            hosted_nodes: hosted::public_nodes(chain_id),
            ..Self::default()
        }
    }

    /// Use `url` as the only node.
    pub fn with_local_node(mut self, url: impl Into<String>) -> Self {
        self.local_node = Some(url.into());
        self
    }

    /// The HTTP failover ladder: the local node alone, or the hosted list.
    pub fn http_nodes(&self) -> Vec<String> {
        match &self.local_node {
            Some(local) => vec![local.clone()],
            None => self.hosted_nodes.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Option<Duration> {
        self.reconnect_max_ms.map(Duration::from_millis)
    }
}
