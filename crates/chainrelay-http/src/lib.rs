//! chainrelay-http: HTTP media for ChainRelay.
//!
//! - [`HttpLink`]: one non-blocking POST per envelope (`reqwest`)
//! - [`SyncHttpLink`]: blocking POST for callers without an event loop
//!   (`reqwest::blocking`)

pub mod blocking;
pub mod client;

pub use blocking::SyncHttpLink;
pub use client::HttpLink;

use chainrelay_core::error::TransportError;

/// Probe envelope sent on connect. Id 0 is never handed out to callers.
pub(crate) const PROBE: &str = r#"{"jsonrpc":"2.0","method":"net_version","params":[],"id":0}"#;

pub(crate) fn map_reqwest(e: reqwest::Error, timeout_ms: u64) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout { ms: timeout_ms }
    } else if e.is_decode() {
        TransportError::Deserialization(e.to_string())
    } else {
        TransportError::Http(e.to_string())
    }
}
