//! Opt-in blocking dispatch over synchronous HTTP.
//!
//! Must run on a thread that has not entered a Tokio runtime.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use chainrelay_core::config::ClientConfig;
use chainrelay_core::context::{settle, ClientContext};
use chainrelay_core::error::{RpcError, TransportError};
use chainrelay_core::link::{BlockingLink, Medium};
use chainrelay_core::request::{parse_reply, JsonRpcRequest, Reply, RpcParam};
use chainrelay_core::returns::ReturnKind;
use chainrelay_http::SyncHttpLink;

/// Blocking failover ladder: the local node alone, or the hosted nodes in
/// order until one gives an interpretable reply.
pub struct BlockingLadder {
    ctx: Arc<ClientContext>,
    links: Vec<Arc<dyn BlockingLink>>,
    local: bool,
}

impl BlockingLadder {
    pub fn new(ctx: Arc<ClientContext>, links: Vec<Arc<dyn BlockingLink>>, local: bool) -> Self {
        Self { ctx, links, local }
    }

    pub fn from_config(ctx: Arc<ClientContext>, config: &ClientConfig) -> Self {
        let links = config
            .http_nodes()
            .into_iter()
            .map(|url| Arc::new(SyncHttpLink::new(url, config.request_timeout())) as Arc<dyn BlockingLink>)
            .collect();
        Self::new(ctx, links, config.local_node.is_some())
    }

    /// Marshal and broadcast in one step.
    pub fn call(&self, method: &str, params: Vec<RpcParam>, returns: &ReturnKind) -> Result<Value, RpcError> {
        let request = JsonRpcRequest::new(self.ctx.next_id(), method, params);
        self.broadcast(&request, returns)
    }

    /// Send `request` and block until a node answers.
    pub fn broadcast(&self, request: &JsonRpcRequest, returns: &ReturnKind) -> Result<Value, RpcError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(RpcError::transport(
                TransportError::Unsupported {
                    medium: Medium::SyncHttp,
                    reason: "blocking dispatch called inside an async runtime".into(),
                },
                request,
            ));
        }

        let payload = request.to_payload();
        let mut last_invalid = None;
        for link in &self.links {
            let body = match link.send_blocking(&payload) {
                Ok(body) => body,
                Err(source) if self.local => {
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
            match parse_reply(&body) {
                Ok(Reply::Single(outcome)) => return settle(request, returns, outcome),
                Ok(Reply::Batch(_)) if self.local => return Err(RpcError::no_response(request)),
                Ok(Reply::Batch(_)) => {
                    warn!(url = %link.address(), method = %request.method, "batch reply to a single request, trying next");
                }
                Err(e) if self.local => return Err(RpcError::from_shape(e, request)),
                Err(e) => {
                    warn!(url = %link.address(), method = %request.method, reason = ?e, "uninterpretable reply, trying next");
                    last_invalid = Some(RpcError::from_shape(e, request));
                }
            }
        }
        Err(last_invalid.unwrap_or_else(|| RpcError::no_response(request)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        url: &'static str,
        reply: Result<&'static str, TransportError>,
        hits: AtomicUsize,
    }

    impl Scripted {
        fn new(url: &'static str, reply: Result<&'static str, TransportError>) -> Arc<Self> {
            Arc::new(Self { url, reply, hits: AtomicUsize::new(0) })
        }
    }

    impl BlockingLink for Scripted {
        fn address(&self) -> &str {
            self.url
        }

        fn send_blocking(&self, _payload: &str) -> Result<String, TransportError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map(str::to_string)
        }
    }

    fn ladder(links: Vec<Arc<Scripted>>, local: bool) -> BlockingLadder {
        let links = links.into_iter().map(|l| l as Arc<dyn BlockingLink>).collect();
        BlockingLadder::new(Arc::new(ClientContext::new()), links, local)
    }

    #[test]
    fn first_interpretable_reply_wins() {
        let down = Scripted::new("http://a", Err(TransportError::Http("refused".into())));
        let garbage = Scripted::new("http://b", Ok("<html>"));
        let good = Scripted::new("http://c", Ok(r#"{"id":1,"result":"0x10"}"#));
        let never = Scripted::new("http://d", Ok(r#"{"id":1,"result":"0x20"}"#));
        let l = ladder(vec![down, garbage, good, never.clone()], false);
        assert_eq!(l.call("eth_blockNumber", vec![], &ReturnKind::Number).unwrap(), json!(16));
        assert_eq!(never.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn local_node_failure_never_falls_back() {
        let local = Scripted::new("http://localhost:8545", Err(TransportError::Http("refused".into())));
        let hosted = Scripted::new("http://hosted", Ok(r#"{"id":1,"result":"0x1"}"#));
        let l = ladder(vec![local, hosted.clone()], true);
        let err = l.call("eth_accounts", vec![], &ReturnKind::Raw).unwrap_err();
        assert!(matches!(err, RpcError::LocalNode { ref url, .. } if url == "http://localhost:8545"));
        assert_eq!(err.request().unwrap().method, "eth_accounts");
        assert_eq!(hosted.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn nobody_answers() {
        let a = Scripted::new("http://a", Err(TransportError::Closed));
        let err = ladder(vec![a], false).call("net_version", vec![], &ReturnKind::Raw).unwrap_err();
        assert!(matches!(err, RpcError::NoResponse { .. }));
    }

    #[test]
    fn unreadable_replies_are_invalid_response() {
        let a = Scripted::new("http://a", Ok("<html>502</html>"));
        let b = Scripted::new("http://b", Ok("<html>502</html>"));
        let err = ladder(vec![a, b.clone()], false)
            .call("eth_blockNumber", vec![], &ReturnKind::Number)
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidResponse { .. }), "{err:?}");
        assert_eq!(err.request().unwrap().method, "eth_blockNumber");
        assert_eq!(b.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_shaped_reply_moves_on() {
        let odd = Scripted::new("http://a", Ok(r#"[{"id":1,"result":"0x1"}]"#));
        let good = Scripted::new("http://b", Ok(r#"{"id":1,"result":"0x2"}"#));
        let l = ladder(vec![odd, good], false);
        assert_eq!(l.call("eth_blockNumber", vec![], &ReturnKind::Number).unwrap(), json!(2));
    }

    #[tokio::test]
    async fn refused_inside_runtime() {
        let a = Scripted::new("http://a", Ok(r#"{"id":1,"result":"0x1"}"#));
        let err = ladder(vec![a.clone()], false).call("net_version", vec![], &ReturnKind::Raw).unwrap_err();
        assert!(matches!(err, RpcError::Transport { source: TransportError::Unsupported { .. }, .. }));
        assert_eq!(a.hits.load(Ordering::SeqCst), 0);
    }
}
