//! Transport-level and dispatch-level error types.

use thiserror::Error;

use crate::link::{Medium, RequestMode};
use crate::request::{JsonRpcError, JsonRpcRequest, ReplyShapeError};

/// Errors raised by a single medium while connecting or sending.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, reset, DNS, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The node answered with a non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// IPC socket connection/send/receive error.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The connection is gone and has not been re-established yet.
    #[error("connection closed")]
    Closed,

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The medium cannot be used on this platform or in this mode.
    #[error("{medium} is not supported: {reason}")]
    Unsupported { medium: Medium, reason: String },

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if the connection is broken rather than the request bad.
    ///
    /// Retryable failures are recovered by requeue + reconnect and never
    /// reach the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::WebSocket(_) | Self::Ipc(_) | Self::Closed | Self::Timeout { .. } => {
                true
            }
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Deserialization(_) | Self::Unsupported { .. } | Self::Other(_) => false,
        }
    }
}

/// Errors surfaced to callers of the dispatcher.
///
/// Every variant that stems from a request carries that request.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Nothing is configured or selected for the requested mode.
    #[error("no {mode} transport available")]
    NoTransport { mode: RequestMode },

    /// Every configured address of every medium failed to connect.
    #[error("no transport could be connected ({attempted} address(es) tried)")]
    ConnectFailed { attempted: usize },

    /// The local node failed; hosted nodes are never tried in its place.
    #[error("local node {url} failed on {}: {source}", .request.method)]
    LocalNode {
        url: String,
        request: Box<JsonRpcRequest>,
        #[source]
        source: TransportError,
    },

    /// No reply arrived within the request timeout.
    #[error("{} timed out after {ms}ms", .request.method)]
    Timeout { ms: u64, request: Box<JsonRpcRequest> },

    /// No node replied, or the reply had no recognizable shape.
    #[error("no response to {}", .request.method)]
    NoResponse { request: Box<JsonRpcRequest> },

    /// The reply body could not be parsed or decoded.
    #[error("invalid response to {}: {reason}", .request.method)]
    InvalidResponse {
        reason: String,
        request: Box<JsonRpcRequest>,
    },

    /// The node returned a JSON-RPC error object.
    #[error("RPC error {} on {}: {}", .error.code, .request.method, .error.message)]
    Rpc {
        error: JsonRpcError,
        request: Box<JsonRpcRequest>,
    },

    /// A fatal (non-retryable) transport failure.
    #[error("transport failure on {}: {source}", .request.method)]
    Transport {
        #[source]
        source: TransportError,
        request: Box<JsonRpcRequest>,
    },
}

impl RpcError {
    /// The request this error stems from, if any.
    pub fn request(&self) -> Option<&JsonRpcRequest> {
        match self {
            Self::NoTransport { .. } | Self::ConnectFailed { .. } => None,
            Self::LocalNode { request, .. }
            | Self::Timeout { request, .. }
            | Self::NoResponse { request }
            | Self::InvalidResponse { request, .. }
            | Self::Rpc { request, .. }
            | Self::Transport { request, .. } => Some(request),
        }
    }

    /// The node's error object, for `Rpc` errors.
    pub fn rpc_error(&self) -> Option<&JsonRpcError> {
        match self {
            Self::Rpc { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn rpc(error: JsonRpcError, request: &JsonRpcRequest) -> Self {
        Self::Rpc {
            error,
            request: Box::new(request.clone()),
        }
    }

    pub fn invalid(reason: impl Into<String>, request: &JsonRpcRequest) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
            request: Box::new(request.clone()),
        }
    }

    pub fn no_response(request: &JsonRpcRequest) -> Self {
        Self::NoResponse {
            request: Box::new(request.clone()),
        }
    }

    pub fn transport(source: TransportError, request: &JsonRpcRequest) -> Self {
        Self::Transport {
            source,
            request: Box::new(request.clone()),
        }
    }

    pub fn timeout(ms: u64, request: &JsonRpcRequest) -> Self {
        Self::Timeout {
            ms,
            request: Box::new(request.clone()),
        }
    }

    /// An unparseable body is `InvalidResponse`; well-formed JSON of the
    /// wrong shape is `NoResponse`.
    pub fn from_shape(err: ReplyShapeError, request: &JsonRpcRequest) -> Self {
        match err {
            ReplyShapeError::Unparseable(reason) => Self::invalid(reason, request),
            ReplyShapeError::Unrecognized => Self::no_response(request),
        }
    }
}
