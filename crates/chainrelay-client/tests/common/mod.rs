//! Scripted nodes shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use chainrelay_core::error::TransportError;
use chainrelay_core::link::{Link, LinkEvent, LinkEvents, Medium};
use chainrelay_core::request::JsonRpcRequest;

/// Request/response node: every POST gets the same canned body.
pub struct HttpNode {
    pub url: &'static str,
    reply: Result<String, TransportError>,
    pub hits: AtomicUsize,
}

impl HttpNode {
    pub fn result(url: &'static str, result: Value) -> Arc<Self> {
        Self::body(url, json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string())
    }

    pub fn error(url: &'static str, code: i64, message: &str) -> Arc<Self> {
        Self::body(
            url,
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": code, "message": message}}).to_string(),
        )
    }

    pub fn body(url: &'static str, body: String) -> Arc<Self> {
        Arc::new(Self { url, reply: Ok(body), hits: AtomicUsize::new(0) })
    }

    pub fn down(url: &'static str) -> Arc<Self> {
        Arc::new(Self {
            url,
            reply: Err(TransportError::Http("connection refused".into())),
            hits: AtomicUsize::new(0),
        })
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for HttpNode {
    fn medium(&self) -> Medium {
        Medium::Http
    }

    fn address(&self) -> &str {
        self.url
    }

    async fn connect(&self, _events: LinkEvents) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, _payload: String) -> Result<Option<String>, TransportError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.reply.clone().map(Some)
    }
}

type Handler = Box<dyn Fn(&JsonRpcRequest) -> Value + Send + Sync>;

/// Socket-style node: replies arrive later as frames, pushes can be injected.
pub struct SocketNode {
    medium: Medium,
    events: Mutex<Option<LinkEvents>>,
    pub log: Mutex<Vec<JsonRpcRequest>>,
    pub connects: AtomicUsize,
    pub refuse: AtomicBool,
    pub fail_sends: AtomicUsize,
    follow_ups: Mutex<Vec<String>>,
    handler: Handler,
}

impl SocketNode {
    pub fn new(medium: Medium, handler: impl Fn(&JsonRpcRequest) -> Value + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            medium,
            events: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            fail_sends: AtomicUsize::new(0),
            follow_ups: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    /// Answers every request with its method name.
    pub fn echo(medium: Medium) -> Arc<Self> {
        Self::new(medium, |req| json!(req.method))
    }

    /// Drop the connection from the node's side.
    pub fn hang_up(&self) {
        if let Some(events) = self.events.lock().unwrap().take() {
            let _ = events.send(LinkEvent::Closed(TransportError::Closed));
        }
    }

    pub fn push(&self, subscription: &str, result: Value) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(LinkEvent::Frame(push_frame(subscription, result)));
        }
    }

    /// Send a push back to back with the next reply frame.
    pub fn push_after_reply(&self, subscription: &str, result: Value) {
        self.follow_ups.lock().unwrap().push(push_frame(subscription, result));
    }

    pub fn methods(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|r| r.method.clone()).collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for SocketNode {
    fn medium(&self) -> Medium {
        self.medium
    }

    fn address(&self) -> &str {
        "socket://node"
    }

    async fn connect(&self, events: LinkEvents) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::WebSocket("refused".into()));
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn send(&self, payload: String) -> Result<Option<String>, TransportError> {
        let failing = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Closed);
        }
        let req: JsonRpcRequest =
            serde_json::from_str(&payload).map_err(|e| TransportError::Deserialization(e.to_string()))?;
        let result = (self.handler)(&req);
        self.log.lock().unwrap().push(req.clone());
        let frame = json!({"jsonrpc": "2.0", "id": req.numeric_id(), "result": result});
        match self.events.lock().unwrap().as_ref() {
            Some(events) => {
                let _ = events.send(LinkEvent::Frame(frame.to_string()));
                for push in self.follow_ups.lock().unwrap().drain(..) {
                    let _ = events.send(LinkEvent::Frame(push));
                }
                Ok(None)
            }
            None => Err(TransportError::Closed),
        }
    }
}

fn push_frame(subscription: &str, result: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": "eth_subscription",
        "params": {"subscription": subscription, "result": result}
    })
    .to_string()
}
