//! Local-broadcast transport adapter.
//!
//! Same-device channel for multi-tab consistency: every participant bound
//! to a channel id receives every other participant's committed commands
//! directly. There is no dispatch service on this path: the hub assigns
//! revisions by appending, so the last writer simply wins and no
//! `Conflict` is ever produced. Not suitable for multi-device sync.

use crate::transport::{Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use objsync_core::{Command, ConnectError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 256;

struct Channel {
    sender: broadcast::Sender<Vec<Command>>,
    revision: u64,
    state: Value,
}

impl Channel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            revision: 0,
            state: Value::Object(Map::new()),
        }
    }
}

/// Owner of the named local channels. One hub per process; participants
/// attach transports to it by channel id.
#[derive(Default)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<String, Channel>>,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport bound to one channel of this hub.
    pub fn transport(self: &Arc<Self>, channel_id: impl Into<String>) -> LocalBroadcastTransport {
        LocalBroadcastTransport {
            hub: Arc::clone(self),
            channel_id: channel_id.into(),
            forward_task: Mutex::new(None),
        }
    }

    /// The channel's current retained revision and state.
    pub async fn retained(&self, channel_id: &str) -> Option<(u64, Value)> {
        let channels = self.channels.lock().await;
        channels
            .get(channel_id)
            .map(|chan| (chan.revision, chan.state.clone()))
    }

    async fn subscribe(&self, channel_id: &str) -> broadcast::Receiver<Vec<Command>> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel_id.to_string())
            .or_insert_with(Channel::new)
            .sender
            .subscribe()
    }

    async fn publish(&self, channel_id: &str, commands: &[Command]) {
        let mut channels = self.channels.lock().await;
        let chan = channels
            .entry(channel_id.to_string())
            .or_insert_with(Channel::new);

        let mut out = Vec::new();
        for cmd in commands {
            match cmd {
                Command::Update(update) => {
                    let mut next = chan.state.clone();
                    if let Err(e) = update.op.apply(&mut next) {
                        warn!(obj_id = %update.obj_id, "dropping unappliable op: {}", e);
                        continue;
                    }
                    chan.state = next;
                    chan.revision += 1;
                    out.push(Command::Remote(objsync_core::RemoteCommand {
                        obj_id: update.obj_id.clone(),
                        origin_client_id: update.client_id.clone(),
                        revision: chan.revision,
                        op: update.op.clone(),
                    }));
                }
                Command::Hello {
                    obj_id, revision, ..
                } => {
                    // behind, or a brand-new channel handing out its first
                    // state; a hello at the current revision needs nothing
                    if *revision < chan.revision || chan.revision == 0 {
                        out.push(Command::Snapshot {
                            obj_id: obj_id.clone(),
                            revision: chan.revision,
                            state: chan.state.clone(),
                        });
                    }
                }
                Command::Ping { obj_id, client_id } => {
                    out.push(Command::Pong {
                        obj_id: obj_id.clone(),
                        client_id: client_id.clone(),
                    });
                }
                // server-authored variants never originate from a peer
                _ => {}
            }
        }

        if !out.is_empty() {
            // no receivers is fine: the author may be the only participant
            let _ = chan.sender.send(out);
        }
    }
}

/// One participant's binding to a hub channel.
pub struct LocalBroadcastTransport {
    hub: Arc<BroadcastHub>,
    channel_id: String,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Transport for LocalBroadcastTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, ConnectError> {
        self.close().await;

        let mut feed = self.hub.subscribe(&self.channel_id).await;
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(batch) => {
                        if tx.send(TransportEvent::Batch(batch)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // lost commands surface as a revision gap, which the
                        // engine repairs by resyncing
                        warn!("local broadcast receiver lagged by {} batches", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            let _ = tx.send(TransportEvent::Closed).await;
        });
        *self.forward_task.lock().await = Some(task);
        Ok(rx)
    }

    async fn send(&self, commands: &[Command]) -> Result<(), TransportError> {
        self.hub.publish(&self.channel_id, commands).await;
        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = self.forward_task.lock().await.take() {
            task.abort();
        }
    }
}
