//! IPC medium over a Unix domain socket.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{info, warn};

use chainrelay_core::error::TransportError;
use chainrelay_core::link::{Link, LinkEvent, LinkEvents, Medium};

use crate::codec::JsonFrameCodec;

type Writer = Arc<tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>;

/// A duplex socket connection to a local node.
pub struct IpcLink {
    path: String,
    writer: Writer,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl IpcLink {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            reader: Mutex::new(None),
        }
    }

    async fn attach<R, W>(&self, read: R, write: W, events: LinkEvents)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        if let Some(old) = self.reader.lock().unwrap().take() {
            old.abort();
        }
        *self.writer.lock().await = Some(Box::new(write));
        let frames = FramedRead::new(read, JsonFrameCodec::default());
        let reader = tokio::spawn(read_loop(self.path.clone(), frames, self.writer.clone(), events));
        *self.reader.lock().unwrap() = Some(reader);
    }
}

impl Drop for IpcLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl Link for IpcLink {
    fn medium(&self) -> Medium {
        Medium::Ipc
    }

    fn address(&self) -> &str {
        &self.path
    }

    #[cfg(unix)]
    async fn connect(&self, events: LinkEvents) -> Result<(), TransportError> {
        info!(path = %self.path, "connecting via IPC");
        let stream = tokio::net::UnixStream::connect(&self.path)
            .await
            .map_err(|e| TransportError::Ipc(e.to_string()))?;
        let (read, write) = stream.into_split();
        self.attach(read, write, events).await;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn connect(&self, _events: LinkEvents) -> Result<(), TransportError> {
        Err(TransportError::Unsupported {
            medium: Medium::Ipc,
            reason: "unix domain sockets are not available on this platform".into(),
        })
    }

    async fn send(&self, payload: String) -> Result<Option<String>, TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| TransportError::Ipc(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Ipc(e.to_string()))?;
        Ok(None)
    }
}

async fn read_loop<R>(path: String, mut frames: FramedRead<R, JsonFrameCodec>, writer: Writer, events: LinkEvents)
where
    R: AsyncRead + Send + Unpin,
{
    let cause = loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                if events.send(LinkEvent::Frame(frame)).is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                warn!(path = %path, error = %e, "IPC read error");
                break TransportError::Ipc(e.to_string());
            }
            None => break TransportError::Closed,
        }
    };
    writer.lock().await.take();
    let _ = events.send(LinkEvent::Closed(cause));
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    fn socket_path(tag: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("chainrelay-{tag}-{}-{nanos}.ipc", std::process::id()))
    }

    #[tokio::test]
    async fn replies_and_pushes_arrive_as_frames() {
        let path = socket_path("frames");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = sock.read(&mut buf).await.unwrap();
            assert!(n > 0);
            // Reply and a push written back-to-back, the push split in two writes.
            sock.write_all(br#"{"jsonrpc":"2.0","id":7,"result":"0x1"}{"jsonrpc":"2.0","method":"eth_subscription","#)
                .await
                .unwrap();
            sock.write_all(br#""params":{"subscription":"0xa","result":{}}}"#).await.unwrap();
        });

        let link = IpcLink::new(path.to_string_lossy());
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.connect(tx).await.unwrap();
        link.send(r#"{"jsonrpc":"2.0","id":7,"method":"eth_chainId","params":[]}"#.into())
            .await
            .unwrap();

        let LinkEvent::Frame(reply) = rx.recv().await.unwrap() else {
            panic!("expected reply frame");
        };
        assert!(reply.contains("\"id\":7"));
        let LinkEvent::Frame(push) = rx.recv().await.unwrap() else {
            panic!("expected push frame");
        };
        assert!(push.contains("eth_subscription"));
        assert!(matches!(rx.recv().await.unwrap(), LinkEvent::Closed(TransportError::Closed)));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn missing_socket_fails_connect() {
        let link = IpcLink::new(socket_path("missing").to_string_lossy());
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = link.connect(tx).await.unwrap_err();
        assert!(matches!(err, TransportError::Ipc(_)));
    }
}
