//! Envelope construction and the failover policy.
//!
//! `broadcast` prefers a duplex medium (injected provider, then IPC, then
//! WebSocket). A configured duplex channel that is down gets exactly one
//! connect attempt before the next medium is tried. With no duplex medium
//! available the request walks the HTTP ladder.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tiny_keccak::{Hasher, Keccak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chainrelay_core::channel::{Channel, ReconnectListenerId};
use chainrelay_core::config::ClientConfig;
use chainrelay_core::context::{settle, ClientContext};
use chainrelay_core::error::RpcError;
use chainrelay_core::flagged;
use chainrelay_core::link::{Link, Medium, RequestMode};
use chainrelay_core::request::{is_empty_result, parse_reply, JsonRpcError, JsonRpcRequest, Reply, RpcParam};
use chainrelay_core::returns::ReturnKind;
use chainrelay_core::subscriptions::SubscriptionId;
use chainrelay_core::transport::RpcTransport;
use chainrelay_core::tx::Transaction;

use crate::blocking::BlockingLadder;
use crate::transporter::Transporter;

/// Duplex media in broadcast preference order.
const DUPLEX_LADDER: [Medium; 3] = [Medium::Injected, Medium::Ipc, Medium::Ws];

/// Builds envelopes and routes them to a node.
pub struct Dispatcher {
    ctx: Arc<ClientContext>,
    config: ClientConfig,
    transporter: Transporter,
    ladder: Vec<Arc<dyn Link>>,
    blocking: BlockingLadder,
    resubscribers: Vec<(Arc<Channel>, ReconnectListenerId)>,
}

impl Dispatcher {
    /// `ladder` is the HTTP failover list: the local node alone, or the
    /// hosted nodes in order.
    pub fn new(
        ctx: Arc<ClientContext>,
        config: ClientConfig,
        transporter: Transporter,
        ladder: Vec<Arc<dyn Link>>,
        blocking: BlockingLadder,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let resubscribers = [Medium::Ipc, Medium::Ws]
                .into_iter()
                .filter_map(|medium| transporter.channel(medium))
                .map(|channel| {
                    let this = this.clone();
                    let medium = channel.medium();
                    let id = channel.add_reconnect_listener(Arc::new(move || {
                        tokio::spawn(resubscribe(this.clone(), medium));
                    }));
                    (channel, id)
                })
                .collect();
            Self {
                ctx,
                config,
                transporter,
                ladder,
                blocking,
                resubscribers,
            }
        })
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }

    pub fn transporter(&self) -> &Transporter {
        &self.transporter
    }

    /// Build a numbered envelope for `prefix + method`.
    pub fn marshal(&self, method: &str, params: Vec<RpcParam>, prefix: &str) -> JsonRpcRequest {
        JsonRpcRequest::new(self.ctx.next_id(), format!("{prefix}{method}"), params)
    }

    /// Send `request` with failover and decode its result as `returns`.
    pub async fn broadcast(&self, request: JsonRpcRequest, returns: ReturnKind) -> Result<Value, RpcError> {
        for medium in DUPLEX_LADDER {
            let Some(channel) = self.transporter.channel(medium) else {
                continue;
            };
            if !channel.is_connected() {
                if let Err(e) = channel.connect().await {
                    warn!(medium = %medium, method = %request.method, error = %e, "duplex medium down, falling through");
                    continue;
                }
            }
            return channel.request(request, returns, self.config.request_timeout()).await;
        }
        self.http_ladder(&request, &returns).await
    }

    /// Walk the HTTP ladder.
    ///
    /// Local node: its answer is final and a transport failure is
    /// [`RpcError::LocalNode`]. Hosted nodes: the first result that is neither
    /// an error nor empty wins; otherwise the last reply stands, including an
    /// unreadable one.
    async fn http_ladder(&self, request: &JsonRpcRequest, returns: &ReturnKind) -> Result<Value, RpcError> {
        let local = self.config.local_node.is_some();
        let payload = request.to_payload();
        let mut last: Option<Result<Value, RpcError>> = None;

        for link in &self.ladder {
            flagged!(self.config.debug.broadcast, url = %link.address(), id = request.numeric_id(), method = %request.method, "POST");
            let body = match link.send(payload.clone()).await {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(source) if local => {
                    return Err(RpcError::LocalNode {
                        url: link.address().to_string(),
                        request: Box::new(request.clone()),
                        source,
                    });
                }
                Err(e) => {
                    warn!(url = %link.address(), method = %request.method, error = %e, "node failed, trying next");
                    continue;
                }
            };
            let outcome = match parse_reply(&body) {
                Ok(Reply::Single(outcome)) => outcome,
                Ok(Reply::Batch(_)) => {
                    debug!(url = %link.address(), method = %request.method, "batch reply to a single request");
                    last = Some(Err(RpcError::no_response(request)));
                    continue;
                }
                Err(e) => {
                    let err = RpcError::from_shape(e.clone(), request);
                    if local {
                        return Err(err);
                    }
                    debug!(url = %link.address(), reason = ?e, "uninterpretable reply");
                    last = Some(Err(err));
                    continue;
                }
            };
            if local || matches!(&outcome, Ok(v) if !is_empty_result(v)) {
                return settle(request, returns, outcome);
            }
            last = Some(settle(request, returns, outcome));
        }

        last.unwrap_or_else(|| Err(RpcError::no_response(request)))
    }

    /// Send a batch over the HTTP ladder. Results are matched positionally.
    pub async fn broadcast_batch(
        &self,
        requests: Vec<JsonRpcRequest>,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        let local = self.config.local_node.is_some();
        let payload = serde_json::to_string(&requests).unwrap_or_default();

        for link in &self.ladder {
            let body = match link.send(payload.clone()).await {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(source) if local => {
                    return Err(RpcError::LocalNode {
                        url: link.address().to_string(),
                        request: Box::new(first.clone()),
                        source,
                    });
                }
                Err(e) => {
                    warn!(url = %link.address(), size = requests.len(), error = %e, "batch failed, trying next");
                    continue;
                }
            };
            return match parse_reply(&body) {
                Ok(Reply::Batch(items)) => Ok(requests
                    .iter()
                    .enumerate()
                    .map(|(i, req)| match items.get(i) {
                        Some(outcome) => settle(req, &ReturnKind::Raw, outcome.clone()),
                        None => Err(RpcError::no_response(req)),
                    })
                    .collect()),
                Ok(Reply::Single(Err(error))) => Err(RpcError::rpc(error, first)),
                Ok(Reply::Single(Ok(_))) => Err(RpcError::no_response(first)),
                Err(e) => Err(RpcError::from_shape(e, first)),
            };
        }
        Err(RpcError::no_response(first))
    }

    /// Blocking broadcast over synchronous HTTP.
    pub fn broadcast_blocking(&self, request: &JsonRpcRequest, returns: &ReturnKind) -> Result<Value, RpcError> {
        self.blocking.broadcast(request, returns)
    }

    /// Send through the best channel for `mode` and wait for the reply.
    pub async fn request(
        &self,
        mode: RequestMode,
        method: &str,
        params: Vec<RpcParam>,
        returns: ReturnKind,
    ) -> Result<Value, RpcError> {
        let channel = self.transporter.select(mode)?;
        let request = self.marshal(method, params, "");
        channel.request(request, returns, self.config.request_timeout()).await
    }

    /// Fire and forget through the best channel. Returns the envelope id.
    pub fn submit(&self, method: &str, params: Vec<RpcParam>) -> Result<u64, RpcError> {
        let channel = self.transporter.select(RequestMode::Any)?;
        let request = self.marshal(method, params, "");
        let id = request.numeric_id();
        channel.submit_work(request);
        Ok(id)
    }

    // --- Subscriptions ---

    /// Open an `eth_subscribe` subscription on a duplex channel.
    pub async fn subscribe(
        &self,
        kind: &str,
        params: Vec<Value>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Value>), RpcError> {
        let channel = self.transporter.select(RequestMode::Duplex)?;
        let mut wire = vec![json!(kind)];
        wire.extend(params.iter().cloned());
        let request = self.marshal("subscribe", wire, "eth_");
        let reply = channel
            .request(request.clone(), ReturnKind::Raw, self.config.request_timeout())
            .await?;
        let Some(id) = reply.as_str() else {
            return Err(RpcError::invalid("subscription id is not a string", &request));
        };
        let id = SubscriptionId(id.to_string());
        let rx = self
            .ctx
            .subscriptions()
            .register(id.clone(), channel.medium(), kind.to_string(), params);
        info!(subscription = %id, kind, medium = %channel.medium(), "subscribed");
        Ok((id, rx))
    }

    /// Close a subscription. Local routing stops even if the node refuses.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<bool, RpcError> {
        self.ctx.subscriptions().remove(id);
        let channel = self.transporter.select(RequestMode::Duplex)?;
        let request = self.marshal("unsubscribe", vec![json!(id.0)], "eth_");
        let reply = channel
            .request(request, ReturnKind::Raw, self.config.request_timeout())
            .await?;
        Ok(reply.as_bool().unwrap_or(false))
    }

    // --- Convenience calls ---

    /// Keccak-256 of `input`: hex-decoded when `0x`-prefixed, UTF-8 bytes otherwise.
    pub fn sha3(input: &str) -> String {
        let bytes = match input.strip_prefix("0x").map(hex::decode) {
            Some(Ok(bytes)) => bytes,
            _ => input.as_bytes().to_vec(),
        };
        let mut hasher = Keccak::v256();
        hasher.update(&bytes);
        let mut out = [0u8; 32];
        hasher.finalize(&mut out);
        format!("0x{}", hex::encode(out))
    }

    pub async fn block_number(&self) -> Result<Value, RpcError> {
        let request = self.marshal("blockNumber", vec![], "eth_");
        self.broadcast(request, ReturnKind::Number).await
    }

    pub async fn net_version(&self) -> Result<Value, RpcError> {
        let request = self.marshal("version", vec![], "net_");
        self.broadcast(request, ReturnKind::Raw).await
    }

    /// `null` when the node does not know the hash.
    pub async fn get_transaction(&self, hash: &str) -> Result<Value, RpcError> {
        let request = self.marshal("getTransactionByHash", vec![json!(hash)], "eth_");
        self.broadcast(request, ReturnKind::Raw).await
    }

    /// Read-only `eth_call` against the latest block, decoded as `tx.returns`.
    pub async fn call(&self, tx: &Transaction, data: &str) -> Result<Value, RpcError> {
        let request = self.marshal("call", vec![tx.call_object(data), json!("latest")], "eth_");
        self.broadcast(request, tx.returns.clone()).await
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for (channel, id) in &self.resubscribers {
            channel.remove_reconnect_listener(*id);
        }
    }
}

#[async_trait]
impl RpcTransport for Dispatcher {
    fn marshal(&self, method: &str, params: Vec<RpcParam>, prefix: &str) -> JsonRpcRequest {
        Dispatcher::marshal(self, method, params, prefix)
    }

    async fn broadcast(&self, request: JsonRpcRequest, returns: ReturnKind) -> Result<Value, RpcError> {
        Dispatcher::broadcast(self, request, returns).await
    }
}

/// Re-open every subscription of `medium` after its channel reconnected.
async fn resubscribe(this: Weak<Dispatcher>, medium: Medium) {
    let Some(dispatcher) = this.upgrade() else {
        return;
    };
    let Some(channel) = dispatcher.transporter.channel(medium) else {
        return;
    };
    for sub in dispatcher.ctx.subscriptions().active_on(medium) {
        let mut wire = vec![json!(sub.kind)];
        wire.extend(sub.params.iter().cloned());
        let request = dispatcher.marshal("subscribe", wire, "eth_");
        match channel
            .request(request, ReturnKind::Raw, dispatcher.config.request_timeout())
            .await
        {
            Ok(Value::String(new_id)) => {
                dispatcher
                    .ctx
                    .subscriptions()
                    .rekey(&sub.id, SubscriptionId(new_id.clone()));
                info!(old = %sub.id, new = %new_id, medium = %medium, "resubscribed");
            }
            Ok(other) => warn!(subscription = %sub.id, reply = %other, "unexpected resubscribe reply"),
            Err(e) => warn!(subscription = %sub.id, error = %e, "resubscribe failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha3_of_empty_input() {
        assert_eq!(
            Dispatcher::sha3(""),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn sha3_hex_input_is_decoded() {
        assert_eq!(Dispatcher::sha3("0x"), Dispatcher::sha3(""));
        assert_ne!(Dispatcher::sha3("0x01"), Dispatcher::sha3("01"));
    }
}
