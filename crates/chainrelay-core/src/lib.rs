//! chainrelay-core: foundation types for ChainRelay.
//!
//! # Overview
//!
//! ChainRelay connects an application to a cluster of blockchain nodes over
//! several transport media, fails over between them, and drives transactions
//! from submission to block inclusion. The core crate defines:
//!
//! - [`JsonRpcRequest`] / [`Reply`]: wire envelope and reply interpretation
//! - [`TransportError`] / [`RpcError`]: structured error taxonomy
//! - [`Link`]: the medium-specific half of a connection
//! - [`Channel`]: FIFO work queue plus reconnect state machine over a link
//! - [`ClientContext`]: pending-request, subscription and transaction tables
//! - [`RpcTransport`]: the dispatch seam the transaction lifecycle sits on
//! - [`returns`]: semantic decoding of raw hex results
//! - [`node_error`]: typed classification of node error messages

/// Emit at `info` when `$flag` is set, at `trace` otherwise.
#[macro_export]
macro_rules! flagged {
    ($flag:expr, $($arg:tt)+) => {
        if $flag {
            tracing::info!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
}

pub mod backoff;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod hosted;
pub mod link;
pub mod node_error;
pub mod request;
pub mod returns;
pub mod subscriptions;
pub mod transport;
pub mod tx;

pub use backoff::Backoff;
pub use channel::{Channel, ChannelState, ReconnectListenerId};
pub use config::{ClientConfig, DebugFlags};
pub use context::ClientContext;
pub use error::{RpcError, TransportError};
pub use link::{BlockingLink, Link, LinkEvent, LinkEvents, Medium, RequestMode};
pub use node_error::{classify, NodeErrorKind};
pub use request::{parse_reply, JsonRpcError, JsonRpcRequest, Reply, RpcId, RpcParam};
pub use returns::ReturnKind;
pub use subscriptions::{SubscriptionId, SubscriptionManager};
pub use transport::RpcTransport;
pub use tx::{PayloadEncoder, RawTxRecord, Transaction, TxRecord, TxSigner, TxStatus};
