//! Transaction data model and the external collaborators the lifecycle uses.

use std::collections::BTreeMap;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::returns::ReturnKind;

/// A state-changing (or simulated) contract call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Transaction {
    pub from: Option<String>,
    pub to: Option<String>,
    /// Call data; handed to the [`PayloadEncoder`] as-is.
    pub data: Option<String>,
    /// Wei, hex-encoded.
    pub value: Option<String>,
    pub gas: Option<String>,
    pub gas_price: Option<String>,
    /// Explicit nonce for externally-signed sends.
    pub nonce: Option<u64>,
    /// How the simulated return value is decoded.
    pub returns: ReturnKind,
    /// Simulated return values that signal a contract-level failure,
    /// mapped to a human-readable reason.
    pub error_codes: BTreeMap<String, String>,
}

impl Transaction {
    pub fn new(from: impl Into<String>, to: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            from: Some(from.into()),
            to: Some(to.into()),
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// The JSON call object for `eth_call` / `eth_sendTransaction`.
    pub fn call_object(&self, data: &str) -> Value {
        let mut obj = Map::new();
        let mut put = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                obj.insert(key.to_string(), Value::String(v.clone()));
            }
        };
        put("from", &self.from);
        put("to", &self.to);
        put("value", &self.value);
        put("gas", &self.gas);
        put("gasPrice", &self.gas_price);
        if let Some(nonce) = self.nonce {
            obj.insert("nonce".into(), Value::String(format!("{nonce:#x}")));
        }
        obj.insert("data".into(), Value::String(data.to_string()));
        Value::Object(obj)
    }

    /// Upper bound on what the transaction spends: `value + gas * gasPrice`.
    pub fn cost(&self) -> U256 {
        let value = parse_quantity(self.value.as_deref());
        let gas = parse_quantity(self.gas.as_deref());
        let price = parse_quantity(self.gas_price.as_deref());
        value.saturating_add(gas.saturating_mul(price))
    }

    /// `true` when both transactions would do the same thing on chain.
    pub fn same_payload(&self, other: &Transaction) -> bool {
        self.to == other.to && self.data == other.data && self.value == other.value
    }
}

fn parse_quantity(q: Option<&str>) -> U256 {
    q.and_then(|s| U256::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .unwrap_or(U256::ZERO)
}

/// Where a tracked transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    /// The poll budget ran out before inclusion.
    Unconfirmed,
    Failed,
    /// Evicted by a same-nonce transaction and sent again.
    Resubmitted,
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Unconfirmed => write!(f, "unconfirmed"),
            Self::Failed => write!(f, "failed"),
            Self::Resubmitted => write!(f, "resubmitted"),
        }
    }
}

/// A tracked transaction, keyed by hash.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxRecord {
    pub hash: String,
    pub tx: Transaction,
    /// Polls performed so far.
    pub count: u32,
    pub status: TxStatus,
    pub block_hash: Option<String>,
    pub block_number: Option<String>,
    /// Decoded simulated return value.
    pub call_return: Option<Value>,
}

impl TxRecord {
    pub fn pending(hash: impl Into<String>, tx: Transaction) -> Self {
        Self {
            hash: hash.into(),
            tx,
            count: 0,
            status: TxStatus::Pending,
            block_hash: None,
            block_number: None,
            call_return: None,
        }
    }
}

/// An externally-signed send, keyed by the hash the node returned.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTxRecord {
    pub tx: Transaction,
    pub cost: U256,
}

/// Failure signal from an encoder or signer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

/// Produces call data for a transaction.
pub trait PayloadEncoder: Send + Sync + 'static {
    fn encode(&self, tx: &Transaction) -> Result<String, CollaboratorError>;
}

/// Uses `Transaction::data` unchanged (`"0x"` when absent).
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEncoder;

impl PayloadEncoder for PassthroughEncoder {
    fn encode(&self, tx: &Transaction) -> Result<String, CollaboratorError> {
        let data = tx.data.as_deref().unwrap_or("0x");
        if !data.starts_with("0x") {
            return Err(CollaboratorError(format!("call data is not hex: {data}")));
        }
        Ok(data.to_string())
    }
}

/// Signs a transaction for `eth_sendRawTransaction`.
///
/// Keys stay with the implementor; the client only sees signed bytes.
pub trait TxSigner: Send + Sync + 'static {
    /// Return the signed raw transaction, hex-encoded.
    fn sign(&self, tx: &Transaction, data: &str, nonce: u64) -> Result<String, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_object_skips_unset_fields() {
        let tx = Transaction::new("0xaa", "0xbb", "0x1234");
        let obj = tx.call_object("0x1234");
        assert_eq!(obj["from"], "0xaa");
        assert_eq!(obj["data"], "0x1234");
        assert!(obj.get("gasPrice").is_none());
        assert!(obj.get("nonce").is_none());
    }

    #[test]
    fn nonce_is_hex_in_call_object() {
        let tx = Transaction { nonce: Some(26), ..Transaction::default() };
        assert_eq!(tx.call_object("0x")["nonce"], "0x1a");
    }

    #[test]
    fn cost_is_value_plus_gas_fee() {
        let tx = Transaction {
            value: Some("0x10".into()),
            gas: Some("0x2".into()),
            gas_price: Some("0x3".into()),
            ..Transaction::default()
        };
        assert_eq!(tx.cost(), U256::from(22u64));
        assert_eq!(Transaction::default().cost(), U256::ZERO);
    }

    #[test]
    fn payload_comparison_ignores_nonce_and_gas() {
        let a = Transaction { nonce: Some(1), gas: Some("0x1".into()), ..Transaction::new("0xa", "0xb", "0x01") };
        let b = Transaction { nonce: Some(2), ..Transaction::new("0xa", "0xb", "0x01") };
        let c = Transaction::new("0xa", "0xb", "0x02");
        assert!(a.same_payload(&b));
        assert!(!a.same_payload(&c));
    }

    #[test]
    fn passthrough_encoder() {
        assert_eq!(PassthroughEncoder.encode(&Transaction::default()).unwrap(), "0x");
        let bad = Transaction { data: Some("zz".into()), ..Transaction::default() };
        assert!(PassthroughEncoder.encode(&bad).is_err());
    }
}
