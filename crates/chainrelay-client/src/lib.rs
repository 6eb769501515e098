//! chainrelay-client: transport selection, failover dispatch, and the
//! transaction lifecycle, wired to one [`ClientContext`].
//!
//! # Example
//!
//! ```no_run
//! use chainrelay_client::{Client, TxObserver};
//! use chainrelay_core::{ClientConfig, Transaction};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder(ClientConfig::default().with_local_node("http://localhost:8545"))
//!     .connect()
//!     .await?;
//! println!("block {}", client.dispatcher().block_number().await?);
//!
//! let (observer, mut events) = TxObserver::new();
//! client
//!     .lifecycle()
//!     .transact(Transaction::new("0xfrom", "0xto", "0x"), &observer)
//!     .await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod dispatcher;
pub mod lifecycle;
pub mod transporter;

pub use blocking::BlockingLadder;
pub use dispatcher::Dispatcher;
pub use lifecycle::{TransactionLifecycle, TxError, TxEvent, TxObserver};
pub use transporter::Transporter;

use std::sync::Arc;

use tracing::info;

use chainrelay_core::config::ClientConfig;
use chainrelay_core::context::ClientContext;
use chainrelay_core::error::RpcError;
use chainrelay_core::link::Link;
use chainrelay_core::transport::RpcTransport;
use chainrelay_core::tx::{PassthroughEncoder, PayloadEncoder, TxSigner};

/// Configures and connects a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    injected: Option<Arc<dyn Link>>,
    extra: Vec<Arc<dyn Link>>,
    encoder: Arc<dyn PayloadEncoder>,
    signer: Option<Arc<dyn TxSigner>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            injected: None,
            extra: Vec::new(),
            encoder: Arc::new(PassthroughEncoder),
            signer: None,
        }
    }

    /// A provider handed in by the embedding application. Preferred over
    /// every other medium.
    pub fn injected(mut self, link: Arc<dyn Link>) -> Self {
        self.injected = Some(link);
        self
    }

    /// An additional link, tried after the configured ones.
    pub fn link(mut self, link: Arc<dyn Link>) -> Self {
        self.extra.push(link);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn PayloadEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Sign locally and send raw transactions.
    pub fn signer(mut self, signer: Arc<dyn TxSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Connect every configured medium in parallel.
    pub async fn connect(self) -> Result<Client, RpcError> {
        let ctx = Arc::new(ClientContext::new());
        let ladder = transporter::http_links(&self.config);

        let mut links: Vec<Arc<dyn Link>> = Vec::new();
        links.extend(self.injected);
        links.extend(transporter::links_from_config(&self.config, &ladder));
        links.extend(self.extra);

        let transporter = Transporter::connect(links, ctx.clone(), &self.config).await?;
        info!(media = ?transporter.media(), attempted = transporter.attempted(), "client connected");

        let blocking = BlockingLadder::from_config(ctx.clone(), &self.config);
        let dispatcher = Dispatcher::new(ctx.clone(), self.config.clone(), transporter, ladder, blocking);
        let lifecycle = TransactionLifecycle::new(
            dispatcher.clone() as Arc<dyn RpcTransport>,
            ctx.clone(),
            self.encoder,
            self.signer,
            &self.config,
        );
        Ok(Client {
            config: self.config,
            ctx,
            dispatcher,
            lifecycle,
        })
    }
}

/// A connected client.
pub struct Client {
    config: ClientConfig,
    ctx: Arc<ClientContext>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: TransactionLifecycle,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn lifecycle(&self) -> &TransactionLifecycle {
        &self.lifecycle
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Clear pending requests, subscriptions, tracked transactions and
    /// poll timers. Connections stay up.
    pub fn reset(&self) {
        self.ctx.reset();
    }
}
