//! Blocking HTTP medium backed by `reqwest::blocking`.
//!
//! Meant for threads without a Tokio runtime (scripts, the CLI). The
//! blocking client is built lazily on first use so that constructing the
//! link inside a runtime is harmless; the async [`Link`] path hops onto the
//! blocking pool.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use chainrelay_core::error::TransportError;
use chainrelay_core::link::{BlockingLink, Link, LinkEvents, Medium};
use chainrelay_core::request::parse_reply;

use crate::{map_reqwest, PROBE};

struct Inner {
    url: String,
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl Inner {
    fn client(&self) -> Result<&reqwest::blocking::Client, TransportError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let built = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(self.client.get_or_init(|| built))
    }

    fn post(&self, payload: &str) -> Result<String, TransportError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let resp = self
            .client()?
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .map_err(|e| map_reqwest(e, timeout_ms))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            return Err(TransportError::HttpStatus { status, body });
        }
        resp.text().map_err(|e| map_reqwest(e, timeout_ms))
    }
}

/// One HTTP endpoint reached with blocking round trips.
#[derive(Clone)]
pub struct SyncHttpLink {
    inner: Arc<Inner>,
}

impl SyncHttpLink {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                timeout: request_timeout,
                client: OnceLock::new(),
            }),
        }
    }
}

impl BlockingLink for SyncHttpLink {
    fn address(&self) -> &str {
        &self.inner.url
    }

    fn send_blocking(&self, payload: &str) -> Result<String, TransportError> {
        tracing::debug!(url = %self.inner.url, bytes = payload.len(), "blocking POST");
        self.inner.post(payload)
    }
}

#[async_trait]
impl Link for SyncHttpLink {
    fn medium(&self) -> Medium {
        Medium::SyncHttp
    }

    fn address(&self) -> &str {
        &self.inner.url
    }

    /// Same reachability probe as the async link, run on the blocking pool.
    async fn connect(&self, _events: LinkEvents) -> Result<(), TransportError> {
        let inner = self.inner.clone();
        let body = tokio::task::spawn_blocking(move || inner.post(PROBE))
            .await
            .map_err(|e| TransportError::Other(format!("blocking probe aborted: {e}")))??;
        parse_reply(&body)
            .map(|_| ())
            .map_err(|e| TransportError::Deserialization(format!("probe reply: {e:?}")))
    }

    async fn send(&self, payload: String) -> Result<Option<String>, TransportError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.post(&payload))
            .await
            .map_err(|e| TransportError::Other(format!("blocking send aborted: {e}")))?
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn serve_once(status: u16, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = sock.read(&mut chunk).unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                let Some(end) = text.find("\r\n\r\n") else {
                    if n == 0 {
                        break;
                    }
                    continue;
                };
                let len = text[..end]
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if n == 0 || buf.len() >= end + 4 + len {
                    break;
                }
            }
            let resp = format!(
                "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn blocking_round_trip() {
        let url = serve_once(200, r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#);
        let link = SyncHttpLink::new(url, Duration::from_secs(5));
        let body = link.send_blocking(r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber","params":[]}"#).unwrap();
        assert!(body.contains("0x1"));
    }

    #[test]
    fn blocking_status_error() {
        let url = serve_once(429, "slow down");
        let link = SyncHttpLink::new(url, Duration::from_secs(5));
        let err = link.send_blocking("{}").unwrap_err();
        assert!(matches!(err, TransportError::HttpStatus { status: 429, .. }));
    }

    #[test]
    fn unreachable_node_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let link = SyncHttpLink::new(format!("http://{addr}"), Duration::from_secs(2));
        assert!(link.send_blocking("{}").unwrap_err().is_retryable());
    }
}
