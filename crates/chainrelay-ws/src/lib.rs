//! chainrelay-ws: WebSocket push-socket medium.
//!
//! # Features
//! - Request multiplexing over a single connection (replies are correlated
//!   by id in the client context, not here)
//! - Subscription pushes forwarded as ordinary frames
//! - Ping/pong keep-alive
//!
//! Reconnect and re-subscribe are handled by the channel that owns the link.

pub mod link;

pub use link::WsLink;
