//! Parallel connection of every configured medium and capability-based
//! channel selection.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use chainrelay_core::channel::Channel;
use chainrelay_core::config::ClientConfig;
use chainrelay_core::context::ClientContext;
use chainrelay_core::error::RpcError;
use chainrelay_core::link::{Link, Medium, RequestMode};
use chainrelay_http::{HttpLink, SyncHttpLink};
use chainrelay_ipc::IpcLink;
use chainrelay_ws::WsLink;

/// At most one connected channel per medium.
pub struct Transporter {
    channels: HashMap<Medium, Arc<Channel>>,
    attempted: usize,
}

impl Transporter {
    /// Connect every link in parallel and keep, per medium, the first link
    /// (in the given order) that connected.
    ///
    /// Resolves only after every slot has either connected or failed. Each
    /// slot is bounded by the request timeout. If no slot connected the
    /// result is a single aggregate [`RpcError::ConnectFailed`].
    pub async fn connect(
        links: Vec<Arc<dyn Link>>,
        ctx: Arc<ClientContext>,
        config: &ClientConfig,
    ) -> Result<Self, RpcError> {
        let attempted = links.len();
        let timeout = config.request_timeout();

        let slots = links.into_iter().map(|link| {
            let channel = Channel::new(link, ctx.clone(), config);
            async move {
                match tokio::time::timeout(timeout, channel.connect()).await {
                    Ok(Ok(())) => Some(channel),
                    Ok(Err(e)) => {
                        warn!(medium = %channel.medium(), url = %channel.address(), error = %e, "slot failed");
                        None
                    }
                    Err(_) => {
                        warn!(
                            medium = %channel.medium(),
                            url = %channel.address(),
                            timeout_ms = timeout.as_millis() as u64,
                            "slot timed out"
                        );
                        None
                    }
                }
            }
        });
        let resolved = join_all(slots).await;

        let mut channels: HashMap<Medium, Arc<Channel>> = HashMap::new();
        for channel in resolved.into_iter().flatten() {
            channels.entry(channel.medium()).or_insert(channel);
        }
        if channels.is_empty() {
            return Err(RpcError::ConnectFailed { attempted });
        }
        for (medium, channel) in &channels {
            info!(medium = %medium, url = %channel.address(), "selected");
        }
        Ok(Self { channels, attempted })
    }

    /// The best channel for `mode`. No match is a hard error.
    pub fn select(&self, mode: RequestMode) -> Result<Arc<Channel>, RpcError> {
        mode.priority()
            .iter()
            .find_map(|medium| self.channels.get(medium).cloned())
            .ok_or(RpcError::NoTransport { mode })
    }

    /// The selected channel of one medium, if it connected at startup.
    pub fn channel(&self, medium: Medium) -> Option<Arc<Channel>> {
        self.channels.get(&medium).cloned()
    }

    /// Media with a selected channel.
    pub fn media(&self) -> Vec<Medium> {
        let mut media: Vec<Medium> = self.channels.keys().copied().collect();
        media.sort_by_key(|m| format!("{m}"));
        media
    }

    /// Number of link slots that were attempted.
    pub fn attempted(&self) -> usize {
        self.attempted
    }
}

/// HTTP links for the failover ladder: the local node alone, or every
/// hosted node in order. Nodes whose client cannot be built are skipped.
pub fn http_links(config: &ClientConfig) -> Vec<Arc<dyn Link>> {
    config
        .http_nodes()
        .into_iter()
        .filter_map(|url| match HttpLink::new(url.clone(), config.request_timeout()) {
            Ok(link) => Some(Arc::new(link) as Arc<dyn Link>),
            Err(e) => {
                warn!(url = %url, error = %e, "skipping node");
                None
            }
        })
        .collect()
}

/// Every link the configuration describes, HTTP ladder included.
pub fn links_from_config(config: &ClientConfig, http: &[Arc<dyn Link>]) -> Vec<Arc<dyn Link>> {
    let mut links: Vec<Arc<dyn Link>> = Vec::new();
    if let Some(path) = &config.ipc_path {
        links.push(Arc::new(IpcLink::new(path.clone())));
    }
    if let Some(url) = &config.ws_url {
        links.push(Arc::new(WsLink::new(url.clone())));
    }
    links.extend(http.iter().cloned());
    for url in config.http_nodes() {
        links.push(Arc::new(SyncHttpLink::new(url, config.request_timeout())));
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chainrelay_core::error::TransportError;
    use chainrelay_core::link::LinkEvents;
    use std::time::Duration;

    struct StubLink {
        medium: Medium,
        url: &'static str,
        delay_ms: u64,
        up: bool,
    }

    #[async_trait]
    impl Link for StubLink {
        fn medium(&self) -> Medium {
            self.medium
        }
        fn address(&self) -> &str {
            self.url
        }
        async fn connect(&self, _events: LinkEvents) -> Result<(), TransportError> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if self.up {
                Ok(())
            } else {
                Err(TransportError::Http("refused".into()))
            }
        }
        async fn send(&self, _payload: String) -> Result<Option<String>, TransportError> {
            Ok(None)
        }
    }

    fn stub(medium: Medium, url: &'static str, delay_ms: u64, up: bool) -> Arc<dyn Link> {
        Arc::new(StubLink { medium, url, delay_ms, up })
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_in_order_wins_per_medium() {
        let ctx = Arc::new(ClientContext::new());
        let t = Transporter::connect(
            vec![
                stub(Medium::Http, "http://a", 50, false),
                stub(Medium::Http, "http://b", 30, true),
                stub(Medium::Http, "http://c", 1, true),
                stub(Medium::Ws, "ws://d", 10, true),
            ],
            ctx,
            &ClientConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(t.channel(Medium::Http).unwrap().address(), "http://b");
        assert_eq!(t.select(RequestMode::Any).unwrap().medium(), Medium::Ws);
        assert_eq!(t.select(RequestMode::Duplex).unwrap().address(), "ws://d");
        assert!(matches!(
            t.select(RequestMode::Sync),
            Err(RpcError::NoTransport { mode: RequestMode::Sync })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_every_slot() {
        let ctx = Arc::new(ClientContext::new());
        let start = tokio::time::Instant::now();
        let t = Transporter::connect(
            vec![stub(Medium::Http, "http://fast", 1, true), stub(Medium::Ws, "ws://slow", 500, true)],
            ctx,
            &ClientConfig::default(),
        )
        .await
        .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(t.channel(Medium::Ws).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn all_failed_is_one_aggregate_error() {
        let ctx = Arc::new(ClientContext::new());
        let err = Transporter::connect(
            vec![stub(Medium::Http, "http://a", 1, false), stub(Medium::Ipc, "/tmp/x", 1, false)],
            ctx,
            &ClientConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, RpcError::ConnectFailed { attempted: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_slot_resolves_as_failed() {
        let ctx = Arc::new(ClientContext::new());
        let config = ClientConfig { request_timeout_ms: 100, ..ClientConfig::default() };
        let t = Transporter::connect(
            vec![stub(Medium::Http, "http://ok", 1, true), stub(Medium::Ws, "ws://hung", 60_000, true)],
            ctx,
            &config,
        )
        .await
        .unwrap();
        assert!(t.channel(Medium::Ws).is_none());
        assert_eq!(t.media(), vec![Medium::Http]);
    }

    #[test]
    fn config_describes_links() {
        let config = ClientConfig {
            ipc_path: Some("/tmp/node.ipc".into()),
            ws_url: Some("ws://localhost:8546".into()),
            ..ClientConfig::default().with_local_node("http://localhost:8545")
        };
        let http = http_links(&config);
        assert_eq!(http.len(), 1);
        let media: Vec<Medium> = links_from_config(&config, &http).iter().map(|l| l.medium()).collect();
        assert_eq!(media, vec![Medium::Ipc, Medium::Ws, Medium::Http, Medium::SyncHttp]);
    }
}
