//! WebSocket accept loop and socket registry.
//!
//! The registry maps transport-level socket ids to outbound frame queues
//! and implements the send-to-socket-by-id primitive the dispatch service
//! fans out through. One task per connection: the reader feeds inbound
//! frames to dispatch, a writer drains the outbound queue into the sink.

use crate::dispatch::{CommandSender, DispatchService};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use objsync_core::{decode_batch, encode_batch, Command, DeliveryFailure};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

/// Registry of live sockets on this server instance.
#[derive(Default)]
pub struct SocketRegistry {
    sockets: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl SocketRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn register(&self, socket_id: &str, tx: mpsc::UnboundedSender<String>) {
        self.sockets.write().await.insert(socket_id.to_string(), tx);
    }

    async fn unregister(&self, socket_id: &str) {
        self.sockets.write().await.remove(socket_id);
    }
}

#[async_trait]
impl CommandSender for SocketRegistry {
    async fn send(&self, socket_id: &str, commands: &[Command]) -> Result<(), DeliveryFailure> {
        let raw = encode_batch(commands).map_err(|e| DeliveryFailure {
            socket_id: socket_id.to_string(),
            reason: format!("encode: {}", e),
        })?;
        let sockets = self.sockets.read().await;
        let tx = sockets.get(socket_id).ok_or_else(|| DeliveryFailure {
            socket_id: socket_id.to_string(),
            reason: "unknown socket".to_string(),
        })?;
        tx.send(raw).map_err(|_| DeliveryFailure {
            socket_id: socket_id.to_string(),
            reason: "socket closed".to_string(),
        })
    }
}

/// The WebSocket front of the dispatch service.
pub struct SyncServer {
    dispatch: Arc<DispatchService>,
    registry: Arc<SocketRegistry>,
}

impl SyncServer {
    pub fn new(dispatch: Arc<DispatchService>, registry: Arc<SocketRegistry>) -> Self {
        Self { dispatch, registry }
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let dispatch = Arc::clone(&self.dispatch);
            let registry = Arc::clone(&self.registry);

            tokio::spawn(async move {
                debug!(%peer, "accepting socket");
                if let Err(e) = serve_socket(stream, dispatch, registry).await {
                    debug!(%peer, "connection ended: {}", e);
                }
            });
        }
    }
}

async fn serve_socket(
    stream: TcpStream,
    dispatch: Arc<DispatchService>,
    registry: Arc<SocketRegistry>,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let socket_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut read) = ws.split();

    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    registry.register(&socket_id, tx).await;
    info!(%socket_id, "socket connected");

    let writer = tokio::spawn(async move {
        while let Some(raw) = outbound.recv().await {
            if sink.send(Message::Text(raw)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(raw)) => match decode_batch(&raw) {
                Ok(commands) => {
                    if let Err(e) = dispatch.handle_message(&socket_id, None, commands).await {
                        error!(%socket_id, "dispatch failed: {}", e);
                    }
                }
                Err(e) => warn!(%socket_id, "dropping undecodable frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            // protocol traffic is text frames only
            Ok(_) => {}
            Err(e) => {
                debug!(%socket_id, "read error: {}", e);
                break;
            }
        }
    }

    registry.unregister(&socket_id).await;
    writer.abort();
    if let Err(e) = dispatch.handle_disconnect(&socket_id).await {
        error!(%socket_id, "disconnect cleanup failed: {}", e);
    }
    info!(%socket_id, "socket disconnected");
    Ok(())
}
