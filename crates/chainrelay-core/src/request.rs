//! JSON-RPC 2.0 wire types and reply interpretation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version tag carried by every envelope.
pub const PROTOCOL_VERSION: &str = "2.0";

/// The canonical "empty" result a node returns for calls with no output.
pub const EMPTY_RESULT: &str = "0x";

/// Method name of out-of-band subscription pushes.
pub const SUBSCRIPTION_METHOD: &str = "eth_subscription";

/// JSON-RPC request ID: a string, a number, or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    pub fn number(n: u64) -> Self {
        Self::Number(n)
    }

    /// Numeric id, if this is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A single JSON-RPC parameter value.
pub type RpcParam = Value;

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<RpcParam>,
    pub id: RpcId,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }

    /// Numeric correlation id (0 for non-numeric ids).
    pub fn numeric_id(&self) -> u64 {
        self.id.as_u64().unwrap_or(0)
    }

    /// Serialize to the wire form.
    pub fn to_payload(&self) -> String {
        // Only strings, numbers and JSON values: serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Normalize whatever a node put in the `error` member to `{code, message}`.
    pub fn normalize(raw: &Value) -> Self {
        match raw {
            Value::Object(obj) => Self {
                code: obj.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| raw.to_string()),
                data: obj.get("data").cloned(),
            },
            Value::String(s) => Self {
                code: -32603,
                message: s.clone(),
                data: None,
            },
            other => Self {
                code: -32603,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// An interpreted reply body.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// One reply object: its `result`, or its normalized `error`.
    Single(Result<Value, JsonRpcError>),
    /// An array reply, extracted positionally.
    Batch(Vec<Result<Value, JsonRpcError>>),
}

/// Why a reply body could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyShapeError {
    /// The body is not JSON at all.
    Unparseable(String),
    /// Valid JSON without a `result`, an `error`, or an array.
    Unrecognized,
}

/// Parse and interpret a raw reply body.
pub fn parse_reply(body: &str) -> Result<Reply, ReplyShapeError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ReplyShapeError::Unparseable(e.to_string()))?;
    interpret(&value)
}

/// Interpret an already-parsed reply value.
pub fn interpret(value: &Value) -> Result<Reply, ReplyShapeError> {
    match value {
        Value::Array(items) => Ok(Reply::Batch(
            items
                .iter()
                .map(|item| member_outcome(item).unwrap_or(Ok(Value::Null)))
                .collect(),
        )),
        Value::Object(_) => member_outcome(value)
            .map(Reply::Single)
            .ok_or(ReplyShapeError::Unrecognized),
        _ => Err(ReplyShapeError::Unrecognized),
    }
}

fn member_outcome(value: &Value) -> Option<Result<Value, JsonRpcError>> {
    let obj = value.as_object()?;
    if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
        return Some(Err(JsonRpcError::normalize(err)));
    }
    obj.get("result").map(|r| Ok(r.clone()))
}

/// `true` for the empty sentinel and for `null`.
pub fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s == EMPTY_RESULT,
        _ => false,
    }
}

/// An out-of-band push: `{method: "eth_subscription", params: {subscription, result}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub subscription: String,
    pub result: Value,
}

impl SubscriptionEvent {
    /// Recognize a subscription push; `None` for anything else.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("method")?.as_str()? != SUBSCRIPTION_METHOD {
            return None;
        }
        let params = value.get("params")?;
        Some(Self {
            subscription: params.get("subscription")?.as_str()?.to_string(),
            result: params.get("result").cloned().unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(1, "eth_blockNumber", vec![]);
        let json = req.to_payload();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"eth_blockNumber\""));
        assert!(json.contains("\"id\":1"));
    }

    #[test]
    fn reply_result_is_unwrapped() {
        let reply = parse_reply(r#"{"jsonrpc":"2.0","id":1,"result":"0x12345"}"#).unwrap();
        assert_eq!(reply, Reply::Single(Ok(json!("0x12345"))));
    }

    #[test]
    fn reply_error_is_normalized() {
        let reply = parse_reply(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"execution reverted"}}"#,
        )
        .unwrap();
        let Reply::Single(Err(err)) = reply else {
            panic!("expected error reply");
        };
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "execution reverted");
    }

    #[test]
    fn string_error_gets_internal_code() {
        let err = JsonRpcError::normalize(&json!("boom"));
        assert_eq!(err.code, -32603);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn batch_reply_is_positional() {
        let reply = parse_reply(
            r#"[{"id":1,"result":"0x1"},{"id":2,"error":{"code":1,"message":"no"}},{"id":3,"result":null}]"#,
        )
        .unwrap();
        let Reply::Batch(items) = reply else {
            panic!("expected batch");
        };
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Ok(json!("0x1")));
        assert_eq!(items[1].as_ref().unwrap_err().code, 1);
        assert_eq!(items[2], Ok(Value::Null));
    }

    #[test]
    fn unknown_shape_and_garbage() {
        assert_eq!(
            parse_reply(r#"{"id":1,"jsonrpc":"2.0"}"#),
            Err(ReplyShapeError::Unrecognized)
        );
        assert_eq!(parse_reply("42"), Err(ReplyShapeError::Unrecognized));
        assert!(matches!(
            parse_reply("<html>bad gateway</html>"),
            Err(ReplyShapeError::Unparseable(_))
        ));
    }

    #[test]
    fn subscription_push_is_recognized() {
        let push = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {"subscription": "0xabc", "result": {"number": "0x1"}}
        });
        let ev = SubscriptionEvent::from_value(&push).unwrap();
        assert_eq!(ev.subscription, "0xabc");
        assert_eq!(ev.result["number"], "0x1");
        assert!(SubscriptionEvent::from_value(&json!({"id": 1, "result": "0x"})).is_none());
    }

    #[test]
    fn empty_sentinel() {
        assert!(is_empty_result(&json!("0x")));
        assert!(is_empty_result(&Value::Null));
        assert!(!is_empty_result(&json!("0x0")));
    }
}
