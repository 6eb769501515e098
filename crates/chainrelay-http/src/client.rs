//! Plain HTTP medium backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use chainrelay_core::error::TransportError;
use chainrelay_core::link::{Link, LinkEvents, Medium};
use chainrelay_core::request::parse_reply;

use crate::{map_reqwest, PROBE};

/// One HTTP endpoint. Every envelope is its own POST; the reply body comes
/// back synchronously from [`Link::send`].
pub struct HttpLink {
    url: String,
    http: reqwest::Client,
    timeout_ms: u64,
}

impl HttpLink {
    /// Create a link for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            http,
            timeout_ms: request_timeout.as_millis() as u64,
        })
    }

    /// POST `payload` and return the body of a successful reply.
    pub async fn post(&self, payload: String) -> Result<String, TransportError> {
        let resp = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| map_reqwest(e, self.timeout_ms))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus { status, body });
        }

        resp.text().await.map_err(|e| map_reqwest(e, self.timeout_ms))
    }
}

#[async_trait]
impl Link for HttpLink {
    fn medium(&self) -> Medium {
        Medium::Http
    }

    fn address(&self) -> &str {
        &self.url
    }

    /// Reachability probe: the node must answer `net_version` with a
    /// JSON-RPC reply of any kind.
    async fn connect(&self, _events: LinkEvents) -> Result<(), TransportError> {
        let body = self.post(PROBE.to_string()).await?;
        parse_reply(&body)
            .map(|_| ())
            .map_err(|e| TransportError::Deserialization(format!("probe reply: {e:?}")))
    }

    async fn send(&self, payload: String) -> Result<Option<String>, TransportError> {
        tracing::debug!(url = %self.url, bytes = payload.len(), "POST");
        self.post(payload).await.map(Some)
    }
}
