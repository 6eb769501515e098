//! The client context: every table a client mutates, in one place.
//!
//! Created with the client and cleared by [`ClientContext::reset`]. Guards are
//! short-held `std::sync::Mutex`es, never held across an `.await`; records
//! handed out are clones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, Id as TaskId};
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::request::{interpret, JsonRpcError, JsonRpcRequest, Reply, SubscriptionEvent};
use crate::returns::{decode, ReturnKind};
use crate::subscriptions::{SubscriptionId, SubscriptionManager};
use crate::tx::{RawTxRecord, Transaction, TxRecord};

/// Completion side of one outstanding request.
pub type Completion = oneshot::Sender<Result<Value, RpcError>>;

struct PendingRequest {
    request: JsonRpcRequest,
    returns: ReturnKind,
    tx: Completion,
}

/// Pending requests, subscriptions, tracked transactions and poll timers.
pub struct ClientContext {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    subscriptions: SubscriptionManager,
    transactions: Mutex<HashMap<String, TxRecord>>,
    raw_txs: Mutex<HashMap<String, RawTxRecord>>,
    notifications: Mutex<HashMap<String, AbortHandle>>,
    max_nonce: Mutex<Option<u64>>,
}

impl Default for ClientContext {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::default(),
            subscriptions: SubscriptionManager::new(),
            transactions: Mutex::default(),
            raw_txs: Mutex::default(),
            notifications: Mutex::default(),
            max_nonce: Mutex::default(),
        }
    }
}

impl ClientContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id. Ids increase monotonically and are never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    // --- pending requests ---

    /// Register `request` as awaiting a reply decoded as `returns`.
    pub fn register(&self, request: JsonRpcRequest, returns: ReturnKind, tx: Completion) {
        let id = request.numeric_id();
        self.pending
            .lock()
            .unwrap()
            .insert(id, PendingRequest { request, returns, tx });
    }

    /// Drop a pending request without completing it (e.g. after a timeout).
    pub fn forget(&self, id: u64) -> bool {
        self.pending.lock().unwrap().remove(&id).is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn take(&self, id: u64) -> Option<PendingRequest> {
        self.pending.lock().unwrap().remove(&id)
    }

    /// Route one inbound frame: a reply, a batch, or a subscription push.
    pub fn route(&self, frame: &str) {
        match serde_json::from_str::<Value>(frame) {
            Ok(value) => self.route_value(value),
            Err(e) => warn!(error = %e, "dropping unparseable frame"),
        }
    }

    fn route_value(&self, value: Value) {
        if let Value::Array(items) = value {
            for item in items {
                self.route_value(item);
            }
            return;
        }
        if let Some(event) = SubscriptionEvent::from_value(&value) {
            let id = SubscriptionId(event.subscription);
            if !self.subscriptions.dispatch(&id, event.result) {
                debug!(subscription = %id, "holding push for unregistered subscription");
            }
            return;
        }
        match value.get("id").and_then(Value::as_u64) {
            Some(id) => {
                if !self.resolve(id, &value) {
                    debug!(id, "reply for unknown request");
                }
            }
            None => debug!("frame without numeric id"),
        }
    }

    /// Complete `request` from a request/response body (HTTP-style media).
    pub fn deliver(&self, request: &JsonRpcRequest, body: &str) {
        match serde_json::from_str::<Value>(body) {
            Ok(batch @ Value::Array(_)) => self.route_value(batch),
            Ok(reply) => {
                self.resolve(request.numeric_id(), &reply);
            }
            Err(e) => {
                self.fail(request.numeric_id(), RpcError::invalid(e.to_string(), request));
            }
        }
    }

    /// Complete the pending request `id` from its reply object.
    pub fn resolve(&self, id: u64, reply: &Value) -> bool {
        let Some(pending) = self.take(id) else {
            return false;
        };
        let outcome = match interpret(reply) {
            Ok(Reply::Single(outcome)) => settle(&pending.request, &pending.returns, outcome),
            Ok(Reply::Batch(_)) | Err(_) => Err(RpcError::no_response(&pending.request)),
        };
        let _ = pending.tx.send(outcome);
        true
    }

    /// Fail the pending request `id`.
    pub fn fail(&self, id: u64, err: RpcError) -> bool {
        match self.take(id) {
            Some(pending) => {
                let _ = pending.tx.send(Err(err));
                true
            }
            None => false,
        }
    }

    // --- transactions ---

    /// Start tracking `record`. Returns `false` if its hash is already tracked.
    pub fn track_tx(&self, record: TxRecord) -> bool {
        let mut txs = self.transactions.lock().unwrap();
        if txs.contains_key(&record.hash) {
            return false;
        }
        txs.insert(record.hash.clone(), record);
        true
    }

    pub fn tx_record(&self, hash: &str) -> Option<TxRecord> {
        self.transactions.lock().unwrap().get(hash).cloned()
    }

    /// Mutate a tracked transaction in place and return the updated snapshot.
    pub fn update_tx<F>(&self, hash: &str, f: F) -> Option<TxRecord>
    where
        F: FnOnce(&mut TxRecord),
    {
        let mut txs = self.transactions.lock().unwrap();
        let record = txs.get_mut(hash)?;
        f(record);
        Some(record.clone())
    }

    /// Stop tracking a transaction; its poll timer is cancelled too.
    pub fn remove_tx(&self, hash: &str) -> Option<TxRecord> {
        self.cancel_notification(hash);
        self.transactions.lock().unwrap().remove(hash)
    }

    pub fn record_raw_tx(&self, hash: impl Into<String>, tx: Transaction) {
        let cost = tx.cost();
        self.raw_txs
            .lock()
            .unwrap()
            .insert(hash.into(), RawTxRecord { tx, cost });
    }

    pub fn raw_tx(&self, hash: &str) -> Option<RawTxRecord> {
        self.raw_txs.lock().unwrap().get(hash).cloned()
    }

    /// Another raw send from the same account with the same nonce but a
    /// different payload, if one exists.
    pub fn find_nonce_conflict(&self, hash: &str, tx: &Transaction) -> Option<String> {
        let nonce = tx.nonce?;
        self.raw_txs
            .lock()
            .unwrap()
            .iter()
            .find(|(other_hash, other)| {
                other_hash.as_str() != hash
                    && other.tx.nonce == Some(nonce)
                    && other.tx.from == tx.from
                    && !other.tx.same_payload(tx)
            })
            .map(|(other_hash, _)| other_hash.clone())
    }

    // --- poll timers ---

    /// Install the poll timer for `hash`, aborting any previous one.
    pub fn set_notification(&self, hash: &str, handle: AbortHandle) {
        if let Some(old) = self
            .notifications
            .lock()
            .unwrap()
            .insert(hash.to_string(), handle)
        {
            old.abort();
        }
    }

    pub fn cancel_notification(&self, hash: &str) -> bool {
        match self.notifications.lock().unwrap().remove(hash) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drop the timer entry for `hash` only if it belongs to task `owner`.
    /// A newer timer installed for the same hash is left alone.
    pub fn release_notification(&self, hash: &str, owner: TaskId) -> bool {
        let mut notifications = self.notifications.lock().unwrap();
        match notifications.get(hash) {
            Some(handle) if handle.id() == owner => {
                notifications.remove(hash);
                true
            }
            _ => false,
        }
    }

    pub fn has_notification(&self, hash: &str) -> bool {
        self.notifications.lock().unwrap().contains_key(hash)
    }

    // --- nonces ---

    /// Record a nonce seen on the wire. The maximum never decreases.
    pub fn observe_nonce(&self, nonce: u64) -> u64 {
        let mut max = self.max_nonce.lock().unwrap();
        let next = max.map_or(nonce, |m| m.max(nonce));
        *max = Some(next);
        next
    }

    pub fn max_nonce(&self) -> Option<u64> {
        *self.max_nonce.lock().unwrap()
    }

    /// Drop every table. The id counter keeps counting.
    pub fn reset(&self) {
        self.pending.lock().unwrap().clear();
        for (_, handle) in self.notifications.lock().unwrap().drain() {
            handle.abort();
        }
        self.subscriptions.clear();
        self.transactions.lock().unwrap().clear();
        self.raw_txs.lock().unwrap().clear();
        *self.max_nonce.lock().unwrap() = None;
    }
}

/// Turn one reply member into the caller's result: decode a value, or wrap
/// the node's error with its request.
pub fn settle(
    request: &JsonRpcRequest,
    returns: &ReturnKind,
    outcome: Result<Value, JsonRpcError>,
) -> Result<Value, RpcError> {
    match outcome {
        Ok(value) => decode(&value, returns).map_err(|e| RpcError::invalid(e.to_string(), request)),
        Err(error) => Err(RpcError::rpc(error, request)),
    }
}
