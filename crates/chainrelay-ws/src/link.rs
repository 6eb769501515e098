//! WebSocket medium over `tokio-tungstenite`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use chainrelay_core::error::TransportError;
use chainrelay_core::link::{Link, LinkEvent, LinkEvents, Medium};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>>;

/// A push-capable WebSocket connection to one node.
///
/// `connect` replaces any previous connection; inbound text frames and the
/// final close are reported through the channel's event sender.
pub struct WsLink {
    url: String,
    sink: WsSink,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            reader: Mutex::new(None),
        }
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl Link for WsLink {
    fn medium(&self) -> Medium {
        Medium::Ws
    }

    fn address(&self) -> &str {
        &self.url
    }

    async fn connect(&self, events: LinkEvents) -> Result<(), TransportError> {
        info!(url = %self.url, "connecting via WebSocket");
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (sink, stream) = ws.split();

        if let Some(old) = self.reader.lock().unwrap().take() {
            old.abort();
        }
        *self.sink.lock().await = Some(sink);
        let reader = tokio::spawn(read_loop(self.url.clone(), stream, self.sink.clone(), events));
        *self.reader.lock().unwrap() = Some(reader);
        Ok(())
    }

    async fn send(&self, payload: String) -> Result<Option<String>, TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        sink.send(Message::Text(payload.into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        Ok(None)
    }
}

/// Forward inbound frames until the connection ends, then report why.
async fn read_loop(url: String, mut stream: SplitStream<WsStream>, sink: WsSink, events: LinkEvents) {
    let cause = loop {
        match stream.next().await {
            None => break TransportError::Closed,
            Some(Err(e)) => {
                warn!(url = %url, error = %e, "WS receive error");
                break TransportError::WebSocket(e.to_string());
            }
            Some(Ok(Message::Text(text))) => {
                if events.send(LinkEvent::Frame(text.to_string())).is_err() {
                    // Channel dropped.
                    return;
                }
            }
            Some(Ok(Message::Ping(data))) => {
                if let Some(sink) = sink.lock().await.as_mut() {
                    let _ = sink.send(Message::Pong(data)).await;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(url = %url, ?frame, "WS closed by server");
                break TransportError::Closed;
            }
            Some(Ok(_)) => {}
        }
    };
    sink.lock().await.take();
    let _ = events.send(LinkEvent::Closed(cause));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Echo every text frame back, then close after `frames` frames.
    async fn echo_server(frames: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(sock).await.unwrap();
            for _ in 0..frames {
                match ws.next().await {
                    Some(Ok(Message::Text(t))) => ws.send(Message::Text(t)).await.unwrap(),
                    _ => break,
                }
            }
            ws.close(None).await.ok();
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn frames_flow_through_events() {
        let url = echo_server(1).await;
        let link = WsLink::new(url);
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.connect(tx).await.unwrap();

        let payload = r#"{"jsonrpc":"2.0","id":1,"method":"eth_chainId","params":[]}"#;
        assert!(link.send(payload.to_string()).await.unwrap().is_none());

        match rx.recv().await.unwrap() {
            LinkEvent::Frame(f) => assert_eq!(f, payload),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), LinkEvent::Closed(_)));
    }

    #[tokio::test]
    async fn send_without_connection_is_closed() {
        let link = WsLink::new("ws://127.0.0.1:1");
        assert!(matches!(link.send("{}".into()).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn refused_connect_is_websocket_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let link = WsLink::new(format!("ws://{addr}"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = link.connect(tx).await.unwrap_err();
        assert!(matches!(err, TransportError::WebSocket(_)));
        assert!(err.is_retryable());
    }
}
