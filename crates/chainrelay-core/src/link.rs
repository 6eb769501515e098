//! The `Link` trait: the medium-specific half of every channel.
//!
//! A link knows how to perform one medium's handshake and how to put one
//! payload on the wire. Queueing, reconnection and reply correlation live in
//! [`Channel`](crate::channel::Channel) and are shared by every medium.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// One way of physically talking to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    /// Non-blocking HTTP POST per request.
    Http,
    /// Blocking HTTP, for callers without an event loop.
    SyncHttp,
    /// Duplex local socket (IPC).
    Ipc,
    /// Push-capable WebSocket.
    Ws,
    /// A provider handed in by the embedding application.
    Injected,
}

impl Medium {
    /// Media able to carry unsolicited subscription pushes.
    pub fn is_duplex(self) -> bool {
        matches!(self, Self::Ipc | Self::Ws)
    }
}

impl std::fmt::Display for Medium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::SyncHttp => write!(f, "sync-http"),
            Self::Ipc => write!(f, "ipc"),
            Self::Ws => write!(f, "ws"),
            Self::Injected => write!(f, "injected"),
        }
    }
}

/// What a caller needs from the transport it is handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMode {
    /// Anything that can carry a request.
    Any,
    /// Strictly synchronous HTTP.
    Sync,
    /// Duplex media that can carry subscriptions.
    Duplex,
}

impl RequestMode {
    /// Eligible media for this mode, best first.
    pub fn priority(self) -> &'static [Medium] {
        match self {
            Self::Any => &[Medium::Injected, Medium::Ipc, Medium::Ws, Medium::Http],
            Self::Sync => &[Medium::SyncHttp],
            Self::Duplex => &[Medium::Ipc, Medium::Ws],
        }
    }
}

impl std::fmt::Display for RequestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Sync => write!(f, "sync"),
            Self::Duplex => write!(f, "duplex"),
        }
    }
}

/// Something a connected link reports back to its channel.
#[derive(Debug)]
pub enum LinkEvent {
    /// One inbound message (a reply, a batch, or a subscription push).
    Frame(String),
    /// The connection dropped.
    Closed(TransportError),
}

/// Where a link delivers inbound frames.
pub type LinkEvents = mpsc::UnboundedSender<LinkEvent>;

/// The medium-specific half of a channel.
///
/// # Object Safety
/// The trait is object-safe and is stored as `Arc<dyn Link>`.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Which medium this link speaks.
    fn medium(&self) -> Medium;

    /// The configured address (URL or socket path).
    fn address(&self) -> &str;

    /// Perform the handshake.
    ///
    /// Socket media keep `events` and push every inbound frame into it,
    /// followed by a single `Closed` when the connection drops.
    async fn connect(&self, events: LinkEvents) -> Result<(), TransportError>;

    /// Put one serialized envelope (or batch) on the wire.
    ///
    /// Request/response media return the reply body. Socket media return
    /// `None`; their reply arrives later as a [`LinkEvent::Frame`].
    async fn send(&self, payload: String) -> Result<Option<String>, TransportError>;
}

/// A link that can complete a round trip on the calling thread.
pub trait BlockingLink: Send + Sync + 'static {
    fn address(&self) -> &str;

    /// Send `payload` and block until the reply body arrives.
    fn send_blocking(&self, payload: &str) -> Result<String, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_prefers_injected_then_sockets_then_http() {
        assert_eq!(
            RequestMode::Any.priority(),
            &[Medium::Injected, Medium::Ipc, Medium::Ws, Medium::Http]
        );
    }

    #[test]
    fn duplex_mode_only_lists_duplex_media() {
        assert!(RequestMode::Duplex.priority().iter().all(|m| m.is_duplex()));
        assert_eq!(RequestMode::Sync.priority(), &[Medium::SyncHttp]);
    }
}
