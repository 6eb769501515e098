//! Typed classification of node error replies.
//!
//! Nodes do not agree on error codes for transaction-pool rejections, so
//! after the code table this falls back to message substring matching.
//! The substring fallback is fragile: it breaks whenever a client rewords
//! its messages.

use crate::request::JsonRpcError;

/// Code geth uses for `execution reverted` with revert data.
const EXECUTION_REVERTED: i64 = 3;

/// What a node error means for the transaction that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeErrorKind {
    /// The nonce was already used by a mined transaction.
    NonceTooLow,
    /// The signed payload could not be decoded (seen on nonce races).
    InvalidRlp,
    /// Same nonce as a pooled transaction with too low a fee bump.
    ReplacementUnderpriced,
    /// The exact transaction is already in the pool.
    KnownTransaction,
    InsufficientFunds,
    /// Execution reverted; carries the revert data when present.
    ExecutionReverted(Option<String>),
    Other,
}

impl NodeErrorKind {
    /// `true` when another transaction already claimed this nonce.
    pub fn is_nonce_conflict(&self) -> bool {
        matches!(self, Self::NonceTooLow | Self::InvalidRlp)
    }
}

impl std::fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonceTooLow => write!(f, "nonce too low"),
            Self::InvalidRlp => write!(f, "invalid rlp"),
            Self::ReplacementUnderpriced => write!(f, "replacement transaction underpriced"),
            Self::KnownTransaction => write!(f, "known transaction"),
            Self::InsufficientFunds => write!(f, "insufficient funds"),
            Self::ExecutionReverted(_) => write!(f, "execution reverted"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Classify a normalized node error.
pub fn classify(err: &JsonRpcError) -> NodeErrorKind {
    if err.code == EXECUTION_REVERTED {
        return NodeErrorKind::ExecutionReverted(revert_data(err));
    }
    classify_message(&err.message, err)
}

// Legacy substring matching.
fn classify_message(message: &str, err: &JsonRpcError) -> NodeErrorKind {
    let msg = message.to_ascii_lowercase();
    if msg.contains("nonce too low") {
        NodeErrorKind::NonceTooLow
    } else if msg.contains("rlp") {
        NodeErrorKind::InvalidRlp
    } else if msg.contains("replacement transaction underpriced") {
        NodeErrorKind::ReplacementUnderpriced
    } else if msg.contains("known transaction") || msg.contains("already known") {
        NodeErrorKind::KnownTransaction
    } else if msg.contains("insufficient funds") {
        NodeErrorKind::InsufficientFunds
    } else if msg.contains("execution reverted") {
        NodeErrorKind::ExecutionReverted(revert_data(err))
    } else {
        NodeErrorKind::Other
    }
}

fn revert_data(err: &JsonRpcError) -> Option<String> {
    err.data.as_ref()?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn err(code: i64, message: &str) -> JsonRpcError {
        JsonRpcError { code, message: message.into(), data: None }
    }

    #[test]
    fn nonce_conflicts() {
        assert_eq!(classify(&err(-32000, "nonce too low")), NodeErrorKind::NonceTooLow);
        assert_eq!(
            classify(&err(-32000, "rlp: expected input list for types.Transaction")),
            NodeErrorKind::InvalidRlp
        );
        assert!(classify(&err(-32000, "Nonce Too Low: next nonce 5")).is_nonce_conflict());
    }

    #[test]
    fn pool_rejections() {
        assert_eq!(
            classify(&err(-32000, "replacement transaction underpriced")),
            NodeErrorKind::ReplacementUnderpriced
        );
        assert_eq!(classify(&err(-32000, "already known")), NodeErrorKind::KnownTransaction);
        assert_eq!(
            classify(&err(-32000, "insufficient funds for gas * price + value")),
            NodeErrorKind::InsufficientFunds
        );
        assert!(!classify(&err(-32000, "insufficient funds")).is_nonce_conflict());
    }

    #[test]
    fn revert_by_code_keeps_data() {
        let e = JsonRpcError {
            code: 3,
            message: "execution reverted: not owner".into(),
            data: Some(json!("0x08c379a0")),
        };
        assert_eq!(
            classify(&e),
            NodeErrorKind::ExecutionReverted(Some("0x08c379a0".into()))
        );
    }

    #[test]
    fn unknown_message() {
        assert_eq!(classify(&err(-32601, "method not found")), NodeErrorKind::Other);
    }
}
