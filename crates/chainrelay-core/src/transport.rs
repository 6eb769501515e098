//! The `RpcTransport` trait: the dispatch seam the transaction lifecycle uses.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RpcError;
use crate::request::{JsonRpcRequest, RpcParam};
use crate::returns::ReturnKind;

/// Builds envelopes and broadcasts them with failover.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Build a numbered envelope for `prefix + method`.
    fn marshal(&self, method: &str, params: Vec<RpcParam>, prefix: &str) -> JsonRpcRequest;

    /// Send `request` and decode its result as `returns`.
    async fn broadcast(&self, request: JsonRpcRequest, returns: ReturnKind) -> Result<Value, RpcError>;

    /// Convenience: marshal a full method name and broadcast it undecoded.
    async fn call_method(&self, method: &str, params: Vec<RpcParam>) -> Result<Value, RpcError> {
        let request = self.marshal(method, params, "");
        self.broadcast(request, ReturnKind::Raw).await
    }
}
