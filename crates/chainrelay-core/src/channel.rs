//! One connection of one medium: a FIFO work queue plus the
//! Disconnected → Connecting → Connected state machine.
//!
//! The queue drains only while connected. A retryable send failure puts the
//! envelope back at the head of the queue, flips the channel to
//! disconnected once, and starts a backoff reconnect loop; queued work keeps
//! its relative order and is delivered after the reconnect. A fatal failure
//! is delivered to the request's completion with the envelope attached.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, warn};

use crate::backoff::Backoff;
use crate::config::{ClientConfig, DebugFlags};
use crate::context::ClientContext;
use crate::error::{RpcError, TransportError};
use crate::flagged;
use crate::link::{Link, LinkEvent, LinkEvents, Medium};
use crate::request::JsonRpcRequest;
use crate::returns::ReturnKind;

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Handle returned by [`Channel::add_reconnect_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReconnectListenerId(u64);

/// Called after every successful reconnect (not the first connect).
pub type ReconnectListener = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    queue: VecDeque<JsonRpcRequest>,
    draining: bool,
    reconnecting: bool,
    ever_connected: bool,
    backoff: Backoff,
}

/// A queued, self-reconnecting connection over one [`Link`].
pub struct Channel {
    link: Arc<dyn Link>,
    ctx: Arc<ClientContext>,
    state: watch::Sender<ChannelState>,
    inner: Mutex<Inner>,
    events: LinkEvents,
    listeners: Mutex<Vec<(ReconnectListenerId, ReconnectListener)>>,
    next_listener: AtomicU64,
    debug: DebugFlags,
    this: Weak<Channel>,
}

impl Channel {
    /// Build a disconnected channel. Must be called inside a Tokio runtime.
    pub fn new(link: Arc<dyn Link>, ctx: Arc<ClientContext>, config: &ClientConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(config.reconnect_initial(), config.reconnect_max());
        let channel = Arc::new_cyclic(|this| Self {
            link,
            ctx,
            state: watch::Sender::new(ChannelState::Disconnected),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                draining: false,
                reconnecting: false,
                ever_connected: false,
                backoff,
            }),
            events: events_tx,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            debug: config.debug,
            this: this.clone(),
        });
        tokio::spawn(pump(Arc::downgrade(&channel), events_rx));
        channel
    }

    pub fn medium(&self) -> Medium {
        self.link.medium()
    }

    pub fn address(&self) -> &str {
        self.link.address()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Envelopes waiting to be sent.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Perform the handshake.
    ///
    /// Concurrent callers share one attempt: whoever claims the
    /// `Disconnected → Connecting` transition connects, everyone else waits
    /// for the outcome. Already connected is a no-op.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let claimed = self.state.send_if_modified(|s| {
            if *s == ChannelState::Disconnected {
                *s = ChannelState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            let mut rx = self.state.subscribe();
            let settled = *rx
                .wait_for(|s| *s != ChannelState::Connecting)
                .await
                .map_err(|_| TransportError::Closed)?;
            return match settled {
                ChannelState::Connected => Ok(()),
                _ => Err(TransportError::Closed),
            };
        }

        flagged!(self.debug.connect, medium = %self.medium(), url = %self.address(), "connecting");
        match self.link.connect(self.events.clone()).await {
            Ok(()) => {
                let reconnected = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.backoff.reset();
                    inner.reconnecting = false;
                    std::mem::replace(&mut inner.ever_connected, true)
                };
                self.state.send_replace(ChannelState::Connected);
                tracing::info!(medium = %self.medium(), url = %self.address(), reconnected, "channel connected");
                if reconnected {
                    self.notify_reconnected();
                }
                self.schedule_drain();
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ChannelState::Disconnected);
                warn!(medium = %self.medium(), url = %self.address(), error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Enqueue an envelope; drain if connected and no drain is running.
    pub fn submit_work(&self, request: JsonRpcRequest) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.queue.push_back(request);
        }
        self.schedule_drain();
    }

    /// Send `request` and wait for its id-correlated reply.
    pub async fn request(
        &self,
        request: JsonRpcRequest,
        returns: ReturnKind,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = request.numeric_id();
        let (tx, rx) = oneshot::channel();
        self.ctx.register(request.clone(), returns, tx);
        self.submit_work(request.clone());

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Completion dropped: the context was reset.
            Ok(Err(_)) => Err(RpcError::no_response(&request)),
            Err(_) => {
                self.ctx.forget(id);
                self.inner
                    .lock()
                    .unwrap()
                    .queue
                    .retain(|queued| queued.id != request.id);
                Err(RpcError::timeout(timeout.as_millis() as u64, &request))
            }
        }
    }

    /// Put one envelope on the wire and route a synchronous reply, if any.
    pub async fn submit_rpc_request(&self, request: &JsonRpcRequest) -> Result<(), TransportError> {
        flagged!(
            self.debug.broadcast,
            medium = %self.medium(),
            id = request.numeric_id(),
            method = %request.method,
            "sending"
        );
        if let Some(body) = self.link.send(request.to_payload()).await? {
            flagged!(self.debug.broadcast, id = request.numeric_id(), body = %body, "reply");
            self.ctx.deliver(request, &body);
        }
        Ok(())
    }

    pub fn add_reconnect_listener(&self, listener: ReconnectListener) -> ReconnectListenerId {
        let id = ReconnectListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    pub fn remove_reconnect_listener(&self, id: ReconnectListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn notify_reconnected(&self) {
        let listeners: Vec<ReconnectListener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener();
        }
    }

    fn schedule_drain(&self) {
        if !self.is_connected() {
            return;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.draining || inner.queue.is_empty() {
                return;
            }
            inner.draining = true;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move { this.drain().await });
    }

    async fn drain(&self) {
        loop {
            let request = {
                let mut inner = self.inner.lock().unwrap();
                let next = if self.is_connected() {
                    inner.queue.pop_front()
                } else {
                    None
                };
                match next {
                    Some(request) => request,
                    None => {
                        inner.draining = false;
                        return;
                    }
                }
            };

            match self.submit_rpc_request(&request).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    {
                        let mut inner = self.inner.lock().unwrap();
                        inner.queue.push_front(request);
                        inner.draining = false;
                    }
                    self.mark_disconnected(&e);
                    return;
                }
                Err(e) => {
                    error!(
                        medium = %self.medium(),
                        id = request.numeric_id(),
                        method = %request.method,
                        error = %e,
                        "fatal send failure"
                    );
                    self.ctx.fail(request.numeric_id(), RpcError::transport(e, &request));
                }
            }
        }
    }

    /// Flip to disconnected (once) and make sure a reconnect loop runs.
    fn mark_disconnected(&self, cause: &TransportError) {
        let flipped = self.state.send_if_modified(|s| {
            if *s == ChannelState::Connected {
                *s = ChannelState::Disconnected;
                true
            } else {
                false
            }
        });
        if flipped {
            warn!(medium = %self.medium(), url = %self.address(), error = %cause, "channel lost");
        }
        self.start_reconnect();
    }

    fn start_reconnect(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.reconnecting {
                return;
            }
            inner.reconnecting = true;
        }
        tokio::spawn(reconnect_loop(self.this.clone()));
    }
}

/// Retry `connect` with backoff until it succeeds or the channel is dropped.
async fn reconnect_loop(this: Weak<Channel>) {
    loop {
        let delay = {
            let Some(channel) = this.upgrade() else {
                return;
            };
            let mut inner = channel.inner.lock().unwrap();
            inner.backoff.next_delay()
        };
        tokio::time::sleep(delay).await;

        let Some(channel) = this.upgrade() else {
            return;
        };
        match channel.connect().await {
            Ok(()) => return,
            Err(e) => {
                let attempts = channel.inner.lock().unwrap().backoff.attempts();
                warn!(
                    medium = %channel.medium(),
                    url = %channel.address(),
                    attempts,
                    error = %e,
                    "reconnect failed"
                );
            }
        }
    }
}

/// Forward link events to the channel until either side goes away.
async fn pump(this: Weak<Channel>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        let Some(channel) = this.upgrade() else {
            return;
        };
        match event {
            LinkEvent::Frame(frame) => {
                flagged!(channel.debug.broadcast, medium = %channel.medium(), frame = %frame, "inbound");
                channel.ctx.route(&frame);
            }
            LinkEvent::Closed(cause) => channel.mark_disconnected(&cause),
        }
    }
}
