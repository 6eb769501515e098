//! Transaction lifecycle: send, simulate, poll until mined.
//!
//! ```text
//! transact ─▶ confirm_tx ─▶ (simulate) ─▶ Sent ─▶ poll ─┬─▶ Confirmed
//!                 │                                     ├─▶ NotConfirmed (budget spent)
//!                 └─▶ Duplicate / Failed                ├─▶ Resubmitted (nonce conflict)
//!                                                       └─▶ NotFound
//! ```
//!
//! Every failure is both emitted to the observer and returned (or logged,
//! for failures found by the background poll).

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use chainrelay_core::config::{ClientConfig, DebugFlags};
use chainrelay_core::context::ClientContext;
use chainrelay_core::error::RpcError;
use chainrelay_core::flagged;
use chainrelay_core::node_error::{classify, NodeErrorKind};
use chainrelay_core::request::is_empty_result;
use chainrelay_core::returns::{decode, ReturnKind};
use chainrelay_core::transport::RpcTransport;
use chainrelay_core::tx::{PayloadEncoder, Transaction, TxRecord, TxSigner, TxStatus};

/// Lifecycle failures. Each carries the transaction it concerns.
#[derive(Debug, Clone, Error)]
pub enum TxError {
    /// The poll budget ran out before the transaction was mined.
    #[error("transaction {hash} not confirmed after {polls} polls")]
    NotConfirmed {
        hash: String,
        polls: u32,
        tx: Box<Transaction>,
    },

    /// The node forgot the hash and no same-nonce rival explains it.
    #[error("transaction {hash} not found")]
    NotFound { hash: String, tx: Box<Transaction> },

    /// The hash is already tracked.
    #[error("transaction {hash} is already tracked")]
    Duplicate { hash: String, tx: Box<Transaction> },

    /// The simulated call returned nothing.
    #[error("simulated call for {hash} returned no value")]
    NullCallReturn { hash: String, tx: Box<Transaction> },

    /// Sending, signing, encoding, or simulating failed.
    #[error("transaction failed: {reason}")]
    Failed {
        hash: Option<String>,
        kind: Option<NodeErrorKind>,
        reason: String,
        tx: Box<Transaction>,
    },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl TxError {
    fn failed(hash: Option<&str>, kind: Option<NodeErrorKind>, reason: impl Into<String>, tx: &Transaction) -> Self {
        Self::Failed {
            hash: hash.map(str::to_string),
            kind,
            reason: reason.into(),
            tx: Box::new(tx.clone()),
        }
    }

    /// Hash of the transaction concerned, when one was assigned.
    pub fn hash(&self) -> Option<&str> {
        match self {
            Self::NotConfirmed { hash, .. }
            | Self::NotFound { hash, .. }
            | Self::Duplicate { hash, .. }
            | Self::NullCallReturn { hash, .. } => Some(hash),
            Self::Failed { hash, .. } => hash.as_deref(),
            Self::Rpc(_) => None,
        }
    }
}

/// What happened to a transaction.
#[derive(Debug, Clone)]
pub enum TxEvent {
    /// Accepted by the node and simulated successfully.
    Sent { hash: String, call_return: Value },
    /// Included in a block. Emitted at most once per hash.
    Confirmed(TxRecord),
    /// `hash` was evicted by `conflicting` and the transaction was sent again.
    Resubmitted { hash: String, conflicting: String },
    Failed(TxError),
}

/// Receives lifecycle events.
#[derive(Clone)]
pub struct TxObserver {
    events: mpsc::UnboundedSender<TxEvent>,
    poll: bool,
}

impl TxObserver {
    /// Observe the whole lifecycle, polling until the transaction settles.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TxEvent>) {
        Self::with_polling(true)
    }

    /// Stop after `Sent`: no confirmation polling.
    pub fn sent_only() -> (Self, mpsc::UnboundedReceiver<TxEvent>) {
        Self::with_polling(false)
    }

    fn with_polling(poll: bool) -> (Self, mpsc::UnboundedReceiver<TxEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events, poll }, rx)
    }

    fn emit(&self, event: TxEvent) {
        let _ = self.events.send(event);
    }
}

/// Drives state-changing calls from submission to inclusion.
#[derive(Clone)]
pub struct TransactionLifecycle {
    transport: Arc<dyn RpcTransport>,
    ctx: Arc<ClientContext>,
    encoder: Arc<dyn PayloadEncoder>,
    signer: Option<Arc<dyn TxSigner>>,
    poll_interval: Duration,
    max_polls: u32,
    debug: DebugFlags,
}

impl TransactionLifecycle {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        ctx: Arc<ClientContext>,
        encoder: Arc<dyn PayloadEncoder>,
        signer: Option<Arc<dyn TxSigner>>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            transport,
            ctx,
            encoder,
            signer,
            poll_interval: config.poll_interval(),
            max_polls: config.max_poll_attempts,
            debug: config.debug,
        }
    }

    fn fail(&self, observer: &TxObserver, err: TxError) -> TxError {
        warn!(hash = err.hash().unwrap_or("-"), error = %err, "transaction failed");
        observer.emit(TxEvent::Failed(err.clone()));
        err
    }

    fn set_status(&self, hash: &str, status: TxStatus) {
        self.ctx.update_tx(hash, |r| r.status = status);
    }

    // --- Submission ---

    /// Send `tx` and hand the returned hash to [`confirm_tx`](Self::confirm_tx).
    ///
    /// With a signer the transaction goes out as `eth_sendRawTransaction`;
    /// otherwise the node signs it (`eth_sendTransaction`).
    pub async fn transact(&self, tx: Transaction, observer: &TxObserver) -> Result<String, TxError> {
        let data = self
            .encoder
            .encode(&tx)
            .map_err(|e| self.fail(observer, TxError::failed(None, None, e.to_string(), &tx)))?;

        let (hash, tx) = match &self.signer {
            Some(signer) => self.send_raw(signer.as_ref(), tx, &data, observer).await?,
            None => {
                let request = self
                    .transport
                    .marshal("sendTransaction", vec![tx.call_object(&data)], "eth_");
                let reply = self
                    .transport
                    .broadcast(request, ReturnKind::Raw)
                    .await
                    .map_err(|e| self.fail(observer, send_error(e, &tx)))?;
                (self.normalize_hash(&reply, &tx, observer)?, tx)
            }
        };
        flagged!(self.debug.tx, hash = %hash, nonce = ?tx.nonce, "transaction sent");
        self.confirm_tx(tx, &hash, observer).await?;
        Ok(hash)
    }

    async fn send_raw(
        &self,
        signer: &dyn TxSigner,
        tx: Transaction,
        data: &str,
        observer: &TxObserver,
    ) -> Result<(String, Transaction), TxError> {
        let mut nonce = match tx.nonce {
            Some(nonce) => nonce,
            None => self.next_nonce(&tx, observer).await?,
        };
        let mut bumped = false;
        loop {
            let signed = Transaction { nonce: Some(nonce), ..tx.clone() };
            let raw = signer
                .sign(&signed, data, nonce)
                .map_err(|e| self.fail(observer, TxError::failed(None, None, e.to_string(), &signed)))?;
            let request = self
                .transport
                .marshal("sendRawTransaction", vec![json!(raw)], "eth_");
            match self.transport.broadcast(request, ReturnKind::Raw).await {
                Ok(reply) => {
                    let hash = self.normalize_hash(&reply, &signed, observer)?;
                    self.ctx.observe_nonce(nonce);
                    self.ctx.record_raw_tx(hash.clone(), signed.clone());
                    return Ok((hash, signed));
                }
                Err(e) => {
                    let conflict = e.rpc_error().map(classify).filter(NodeErrorKind::is_nonce_conflict);
                    match conflict {
                        Some(kind) if !bumped => {
                            bumped = true;
                            let next = self.ctx.max_nonce().map_or(nonce, |max| max.max(nonce)) + 1;
                            warn!(nonce, next, reason = %kind, "nonce conflict, re-signing");
                            self.ctx.observe_nonce(nonce);
                            nonce = next;
                        }
                        _ => return Err(self.fail(observer, send_error(e, &signed))),
                    }
                }
            }
        }
    }

    /// Pending nonce of `tx.from`, raised past every nonce this client used.
    async fn next_nonce(&self, tx: &Transaction, observer: &TxObserver) -> Result<u64, TxError> {
        let Some(from) = tx.from.as_deref() else {
            return Err(self.fail(observer, TxError::failed(None, None, "raw send needs a sender", tx)));
        };
        let request = self
            .transport
            .marshal("getTransactionCount", vec![json!(from), json!("pending")], "eth_");
        let count = self
            .transport
            .broadcast(request, ReturnKind::Number)
            .await
            .map_err(|e| self.fail(observer, TxError::Rpc(e)))?;
        let pending = count.as_u64().ok_or_else(|| {
            self.fail(observer, TxError::failed(None, None, format!("bad transaction count: {count}"), tx))
        })?;
        Ok(match self.ctx.max_nonce() {
            Some(max) => pending.max(max + 1),
            None => pending,
        })
    }

    fn normalize_hash(&self, reply: &Value, tx: &Transaction, observer: &TxObserver) -> Result<String, TxError> {
        match reply.as_str().filter(|h| !is_empty_result(&json!(h))) {
            Some(h) => {
                let h = h.to_ascii_lowercase();
                Ok(if h.starts_with("0x") { h } else { format!("0x{h}") })
            }
            None => Err(self.fail(
                observer,
                TxError::failed(None, None, format!("node returned no transaction hash: {reply}"), tx),
            )),
        }
    }

    // --- Confirmation ---

    /// Track `hash`, simulate `tx`, and start polling when the observer asks.
    ///
    /// A hash that is already tracked fails with [`TxError::Duplicate`]
    /// without simulating. Returns the decoded simulated return value.
    pub async fn confirm_tx(&self, tx: Transaction, hash: &str, observer: &TxObserver) -> Result<Value, TxError> {
        if !self.ctx.track_tx(TxRecord::pending(hash, tx.clone())) {
            return Err(self.fail(
                observer,
                TxError::Duplicate {
                    hash: hash.to_string(),
                    tx: Box::new(tx),
                },
            ));
        }

        match self.simulate(&tx, hash).await {
            Ok(call_return) => {
                self.ctx.update_tx(hash, |r| r.call_return = Some(call_return.clone()));
                flagged!(self.debug.tx, hash, call_return = %call_return, "simulated");
                observer.emit(TxEvent::Sent {
                    hash: hash.to_string(),
                    call_return: call_return.clone(),
                });
                if observer.poll {
                    self.tx_notify(hash, observer.clone());
                }
                Ok(call_return)
            }
            Err(err) => {
                self.set_status(hash, TxStatus::Failed);
                Err(self.fail(observer, err))
            }
        }
    }

    /// Read-only run of the same call to learn its logical return value.
    async fn simulate(&self, tx: &Transaction, hash: &str) -> Result<Value, TxError> {
        let data = self
            .encoder
            .encode(tx)
            .map_err(|e| TxError::failed(Some(hash), None, e.to_string(), tx))?;
        let request = self
            .transport
            .marshal("call", vec![tx.call_object(&data), json!("latest")], "eth_");
        let raw = match self.transport.broadcast(request, ReturnKind::Raw).await {
            Ok(raw) => raw,
            Err(RpcError::Rpc { error, .. }) => {
                return Err(TxError::failed(Some(hash), Some(classify(&error)), error.message, tx));
            }
            Err(e) => return Err(TxError::Rpc(e)),
        };
        if is_empty_result(&raw) {
            return Err(TxError::NullCallReturn {
                hash: hash.to_string(),
                tx: Box::new(tx.clone()),
            });
        }
        let decoded = decode(&raw, &tx.returns)
            .map_err(|e| TxError::failed(Some(hash), None, e.to_string(), tx))?;
        if let Some(reason) = error_code(tx, &decoded).or_else(|| error_code(tx, &raw)) {
            return Err(TxError::failed(Some(hash), None, reason, tx));
        }
        Ok(decoded)
    }

    /// Start (or restart) the poll timer for `hash`.
    pub fn tx_notify(&self, hash: &str, observer: TxObserver) {
        let handle = tokio::spawn(self.poll_task(hash.to_string(), observer));
        self.ctx.set_notification(hash, handle.abort_handle());
        if handle.is_finished() {
            self.ctx.release_notification(hash, handle.id());
        }
    }

    fn poll_task(&self, hash: String, observer: TxObserver) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move { this.poll_loop(hash, observer).await })
    }

    async fn poll_loop(self, hash: String, observer: TxObserver) {
        loop {
            if self.poll_once(&hash, &observer).await {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        // Only this task's own entry: a later tx_notify may have replaced it.
        if let Some(me) = tokio::task::try_id() {
            self.ctx.release_notification(&hash, me);
        }
    }

    /// One poll. Returns `true` once the transaction has settled.
    async fn poll_once(&self, hash: &str, observer: &TxObserver) -> bool {
        let Some(record) = self.ctx.update_tx(hash, |r| r.count += 1) else {
            return true;
        };
        if record.status != TxStatus::Pending {
            return true;
        }
        flagged!(self.debug.tx, hash, poll = record.count, "polling");

        let request = self
            .transport
            .marshal("getTransactionByHash", vec![json!(hash)], "eth_");
        match self.transport.broadcast(request, ReturnKind::Raw).await {
            Ok(Value::Null) => {
                self.handle_missing(record, observer).await;
                true
            }
            Ok(fetched) => self.check_block_hash(hash, &fetched, observer),
            Err(e) => {
                warn!(hash, error = %e, "poll failed");
                self.check_budget(hash, observer)
            }
        }
    }

    /// Confirm `hash` if `fetched` names a block; otherwise spend budget.
    ///
    /// Returns `true` once the transaction has settled. `Confirmed` is
    /// emitted at most once per hash.
    pub fn check_block_hash(&self, hash: &str, fetched: &Value, observer: &TxObserver) -> bool {
        let block_hash = fetched
            .get("blockHash")
            .and_then(Value::as_str)
            .filter(|h| !is_zero_hash(h));
        let Some(block_hash) = block_hash else {
            return self.check_budget(hash, observer);
        };

        let mut first = false;
        let record = self.ctx.update_tx(hash, |r| {
            if r.status == TxStatus::Pending {
                r.status = TxStatus::Confirmed;
                r.block_hash = Some(block_hash.to_string());
                r.block_number = fetched
                    .get("blockNumber")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                first = true;
            }
        });
        if let (true, Some(record)) = (first, record) {
            self.ctx.cancel_notification(hash);
            tracing::info!(hash, block = %block_hash, polls = record.count, "transaction confirmed");
            observer.emit(TxEvent::Confirmed(record));
        }
        true
    }

    fn check_budget(&self, hash: &str, observer: &TxObserver) -> bool {
        let Some(record) = self.ctx.tx_record(hash) else {
            return true;
        };
        if record.count < self.max_polls {
            return false;
        }
        let mut first = false;
        self.ctx.update_tx(hash, |r| {
            if r.status == TxStatus::Pending {
                r.status = TxStatus::Unconfirmed;
                first = true;
            }
        });
        if first {
            self.ctx.cancel_notification(hash);
            let _ = self.fail(
                observer,
                TxError::NotConfirmed {
                    hash: hash.to_string(),
                    polls: record.count,
                    tx: Box::new(record.tx),
                },
            );
        }
        true
    }

    /// The node no longer knows the hash: resubmit if a same-nonce rival
    /// evicted it, fail otherwise.
    async fn handle_missing(&self, record: TxRecord, observer: &TxObserver) {
        let Some(conflicting) = self.ctx.find_nonce_conflict(&record.hash, &record.tx) else {
            self.set_status(&record.hash, TxStatus::Failed);
            let _ = self.fail(
                observer,
                TxError::NotFound {
                    hash: record.hash,
                    tx: Box::new(record.tx),
                },
            );
            return;
        };

        self.set_status(&record.hash, TxStatus::Resubmitted);
        warn!(hash = %record.hash, conflicting = %conflicting, "evicted by same-nonce transaction, resubmitting");
        observer.emit(TxEvent::Resubmitted {
            hash: record.hash.clone(),
            conflicting,
        });
        let retry = Transaction { nonce: None, ..record.tx };
        if let Err(e) = self.transact(retry, observer).await {
            warn!(hash = %record.hash, error = %e, "resubmission failed");
        }
    }
}

fn send_error(e: RpcError, tx: &Transaction) -> TxError {
    match e.rpc_error() {
        Some(error) => TxError::failed(None, Some(classify(error)), error.message.clone(), tx),
        None => TxError::Rpc(e),
    }
}

fn error_code(tx: &Transaction, value: &Value) -> Option<String> {
    let key = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    tx.error_codes.get(&key).cloned()
}

fn is_zero_hash(h: &str) -> bool {
    h.trim_start_matches("0x").chars().all(|c| c == '0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_block_hash() {
        assert!(is_zero_hash("0x0000000000000000000000000000000000000000000000000000000000000000"));
        assert!(is_zero_hash("0x"));
        assert!(!is_zero_hash("0x00ab"));
    }

    #[test]
    fn error_codes_match_decoded_or_raw() {
        let mut tx = Transaction::new("0xa", "0xb", "0x");
        tx.error_codes.insert("-1".into(), "market closed".into());
        assert_eq!(error_code(&tx, &json!(-1)).as_deref(), Some("market closed"));
        assert_eq!(error_code(&tx, &json!("0x01")), None);
    }

    #[test]
    fn send_error_keeps_node_classification() {
        let req = chainrelay_core::request::JsonRpcRequest::new(1, "eth_sendRawTransaction", vec![]);
        let err = RpcError::rpc(
            chainrelay_core::request::JsonRpcError {
                code: -32000,
                message: "nonce too low".into(),
                data: None,
            },
            &req,
        );
        match send_error(err, &Transaction::default()) {
            TxError::Failed { kind, .. } => assert_eq!(kind, Some(NodeErrorKind::NonceTooLow)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
