//! WebSocket transport adapter.
//!
//! Binds the engine to a persistent bidirectional socket to the server
//! dispatch service. This is the path where every write round-trips through
//! the server's compare-and-swap gate before any client sees the result.

use crate::transport::{Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use objsync_core::{decode_batch, encode_batch, Command, ConnectError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Client side of the server dispatch path.
pub struct WebSocketTransport {
    endpoint: String,
    writer: Mutex<Option<WsSink>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Create a transport for a `ws://` or `wss://` endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, ConnectError> {
        // replace any previous channel
        self.close().await;

        let (stream, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        let (sink, mut read) = stream.split();

        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(raw)) => match decode_batch(&raw) {
                        Ok(batch) => {
                            if tx.send(TransportEvent::Batch(batch)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("dropping undecodable frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    // protocol traffic is text frames only
                    Ok(_) => {}
                    Err(e) => {
                        debug!("socket read error: {}", e);
                        break;
                    }
                }
            }
            let _ = tx.send(TransportEvent::Closed).await;
        });

        *self.writer.lock().await = Some(sink);
        *self.reader_task.lock().await = Some(task);
        Ok(rx)
    }

    async fn send(&self, commands: &[Command]) -> Result<(), TransportError> {
        let raw = encode_batch(commands).map_err(|e| TransportError::Send(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Text(raw))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
    }
}
