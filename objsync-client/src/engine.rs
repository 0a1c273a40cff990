//! Transport-agnostic client sync engine.
//!
//! Owns the reconnect/command lifecycle for a single client's subscription
//! to one synced object. The engine never applies a mutation optimistically:
//! local state only changes when the authoritative `Remote`, `Snapshot`, or
//! `Conflict` arrives, so a client can never diverge from the server's
//! ordering. Revision gaps are repaired by resyncing, never by patching
//! around them.

use crate::transport::{Transport, TransportError, TransportEvent};
use objsync_core::{ClientCommand, Command, ConnectError, Op, RemoteCommand};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Engine lifecycle: `Disconnected → Connecting → Connected → Disconnected`
/// (on ping loss, error, or teardown) and back via auto-retry, until the
/// terminal `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disposed,
}

/// Notifications delivered to engine subscribers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// First authoritative state arrived.
    Ready,
    /// A committed op was applied.
    Updated { revision: u64 },
    /// Local state was replaced wholesale (snapshot or conflict adoption).
    Resynced { revision: u64 },
    /// A queued op was dropped after exhausting its conflict retries.
    OpFailed { reason: String },
    /// The connection transformer declined this client.
    Rejected { reason: String },
}

/// Errors surfaced by the engine's public API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("client disposed")]
    Disposed,
}

/// Tunables for liveness, reconnection, and conflict retry.
#[derive(Debug, Clone)]
pub struct SyncClientOptions {
    /// Ping cadence; `None` disables liveness probing (local transports).
    pub ping_interval: Option<Duration>,
    /// No inbound traffic for this long counts as a lost connection.
    pub liveness_window: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// How many times one op may be re-based after conflicts before it is
    /// dropped.
    pub conflict_retry_limit: u32,
}

impl Default for SyncClientOptions {
    fn default() -> Self {
        Self {
            ping_interval: None,
            liveness_window: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(8),
            conflict_retry_limit: 8,
        }
    }
}

impl SyncClientOptions {
    /// Defaults for a networked socket transport (pings enabled).
    pub fn socket_defaults() -> Self {
        Self {
            ping_interval: Some(Duration::from_secs(10)),
            ..Self::default()
        }
    }
}

struct PendingOp {
    op: Op,
    retries: u32,
}

struct LocalState {
    revision: u64,
    state: Value,
    ready: bool,
    pending: VecDeque<PendingOp>,
    /// Whether the front of `pending` has been handed to the transport and
    /// is awaiting its authoritative echo. Ops are dispatched one at a time
    /// so each carries a fresh base revision.
    in_flight: bool,
}

/// One client's subscription to one synced object.
pub struct SyncClient {
    inner: Arc<Inner>,
}

struct Inner {
    obj_id: String,
    client_id: String,
    opts: SyncClientOptions,
    transport: Box<dyn Transport>,
    local: StdMutex<LocalState>,
    conn_tx: watch::Sender<ConnectionState>,
    ready_tx: watch::Sender<bool>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(
        obj_id: impl Into<String>,
        client_id: impl Into<String>,
        transport: impl Transport,
        opts: SyncClientOptions,
    ) -> Self {
        let (conn_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (ready_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                obj_id: obj_id.into(),
                client_id: client_id.into(),
                opts,
                transport: Box::new(transport),
                local: StdMutex::new(LocalState {
                    revision: 0,
                    state: Value::Null,
                    ready: false,
                    pending: VecDeque::new(),
                    in_flight: false,
                }),
                conn_tx,
                ready_tx,
                events,
            }),
        }
    }

    pub fn obj_id(&self) -> &str {
        &self.inner.obj_id
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Establish the transport and subscribe to the object.
    ///
    /// A handshake failure is returned to the caller; once connected, later
    /// drops are repaired by the engine itself with capped backoff.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        match *inner.conn_tx.borrow() {
            ConnectionState::Disposed => return Err(ConnectError::Disposed),
            ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected => {}
        }

        inner.set_conn(ConnectionState::Connecting);
        let rx = match inner.transport.connect().await {
            Ok(rx) => rx,
            Err(e) => {
                inner.set_conn(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        inner.set_conn(ConnectionState::Connected);
        inner.send_hello().await;
        tokio::spawn(Inner::run(Arc::clone(inner), rx));
        Ok(())
    }

    /// Resolve once the first authoritative state has been applied.
    pub async fn wait_ready(&self) {
        let mut rx = self.inner.ready_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Queue one mutation against the currently observed revision.
    ///
    /// Ops go out one at a time; the next is dispatched when the previous
    /// one's echo (or conflict) arrives.
    pub async fn send_op(&self, op: Op) -> Result<(), ClientError> {
        if self.inner.is_disposed() {
            return Err(ClientError::Disposed);
        }
        {
            let mut local = self.inner.local.lock().unwrap();
            local.pending.push_back(PendingOp { op, retries: 0 });
        }
        self.inner.dispatch_next().await;
        Ok(())
    }

    /// Snapshot of the local state.
    pub fn state(&self) -> Value {
        self.inner.local.lock().unwrap().state.clone()
    }

    /// Last applied revision.
    pub fn revision(&self) -> u64 {
        self.inner.local.lock().unwrap().revision
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.conn_tx.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.conn_tx.subscribe()
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Terminal teardown: releases the transport, no further reconnects.
    pub async fn dispose(&self) {
        self.inner.dispose_internal().await;
    }
}

impl Inner {
    fn set_conn(&self, state: ConnectionState) {
        self.conn_tx.send_replace(state);
    }

    fn is_disposed(&self) -> bool {
        *self.conn_tx.borrow() == ConnectionState::Disposed
    }

    async fn dispose_internal(&self) {
        if self.is_disposed() {
            return;
        }
        self.set_conn(ConnectionState::Disposed);
        self.transport.close().await;
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<TransportEvent>) {
        loop {
            self.drive(&mut rx).await;
            if self.is_disposed() {
                return;
            }
            self.set_conn(ConnectionState::Disconnected);
            match self.reconnect().await {
                Some(next) => rx = next,
                None => return,
            }
        }
    }

    /// Pump one established channel until it ends (close, error, or lost
    /// liveness).
    async fn drive(&self, rx: &mut mpsc::Receiver<TransportEvent>) {
        let pings_enabled = self.opts.ping_interval.is_some();
        let period = self
            .opts
            .ping_interval
            .unwrap_or(Duration::from_secs(3600));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(TransportEvent::Batch(commands)) => {
                        last_inbound = Instant::now();
                        for cmd in commands {
                            self.handle_command(cmd).await;
                        }
                    }
                    Some(TransportEvent::Closed) | None => {
                        debug!(obj_id = %self.obj_id, "transport channel closed");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if !pings_enabled {
                        continue;
                    }
                    if last_inbound.elapsed() > self.opts.liveness_window {
                        warn!(obj_id = %self.obj_id, "ping lost, tearing down transport");
                        self.transport.close().await;
                        return;
                    }
                    let ping = Command::Ping {
                        obj_id: self.obj_id.clone(),
                        client_id: self.client_id.clone(),
                    };
                    if self.transport.send(&[ping]).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Option<mpsc::Receiver<TransportEvent>> {
        let mut delay = self.opts.reconnect_base_delay;
        loop {
            tokio::time::sleep(delay).await;
            if self.is_disposed() {
                return None;
            }
            self.set_conn(ConnectionState::Connecting);
            match self.transport.connect().await {
                Ok(rx) => {
                    info!(obj_id = %self.obj_id, "reconnected");
                    self.set_conn(ConnectionState::Connected);
                    self.local.lock().unwrap().in_flight = false;
                    self.send_hello().await;
                    self.dispatch_next().await;
                    return Some(rx);
                }
                Err(e) => {
                    warn!(obj_id = %self.obj_id, "reconnect failed: {}", e);
                    self.set_conn(ConnectionState::Disconnected);
                    delay = (delay * 2).min(self.opts.reconnect_max_delay);
                }
            }
        }
    }

    async fn handle_command(&self, cmd: Command) {
        match cmd {
            Command::Remote(remote) if remote.obj_id == self.obj_id => {
                self.handle_remote(remote).await;
            }
            Command::Snapshot {
                obj_id,
                revision,
                state,
            } if obj_id == self.obj_id => {
                self.handle_snapshot(revision, state).await;
            }
            Command::Conflict {
                obj_id,
                revision,
                state,
            } if obj_id == self.obj_id => {
                self.handle_conflict(revision, state).await;
            }
            Command::Rejected { obj_id, reason } if obj_id == self.obj_id => {
                error!(obj_id = %self.obj_id, %reason, "connection rejected");
                let _ = self.events.send(ClientEvent::Rejected { reason });
                // terminal: retrying would mask an auth failure as flakiness
                self.dispose_internal().await;
            }
            Command::Resync { obj_id } if obj_id == self.obj_id => {
                self.send_hello().await;
            }
            // pongs only matter as inbound traffic, already counted
            Command::Pong { .. } => {}
            // peer traffic on a shared broadcast channel
            _ => {}
        }
    }

    async fn handle_remote(&self, remote: RemoteCommand) {
        enum Action {
            Ignore,
            Resync,
            Applied { revision: u64, echo: bool },
        }

        let action = {
            let mut local = self.local.lock().unwrap();
            if remote.revision <= local.revision {
                // redelivery of something already applied
                Action::Ignore
            } else if remote.revision != local.revision + 1 {
                Action::Resync
            } else {
                match remote.op.apply(&mut local.state) {
                    Ok(()) => {
                        local.revision = remote.revision;
                        let echo = remote.origin_client_id == self.client_id;
                        if echo && local.in_flight {
                            local.pending.pop_front();
                            local.in_flight = false;
                        }
                        Action::Applied {
                            revision: remote.revision,
                            echo,
                        }
                    }
                    Err(e) => {
                        warn!(obj_id = %self.obj_id, "committed op failed to apply: {}", e);
                        Action::Resync
                    }
                }
            }
        };

        match action {
            Action::Ignore => {}
            Action::Resync => {
                warn!(
                    obj_id = %self.obj_id,
                    revision = remote.revision,
                    "revision gap detected, resyncing"
                );
                self.send_hello().await;
            }
            Action::Applied { revision, echo } => {
                let _ = self.events.send(ClientEvent::Updated { revision });
                if echo {
                    self.dispatch_next().await;
                }
            }
        }
    }

    async fn handle_snapshot(&self, revision: u64, state: Value) {
        let (applied, became_ready) = {
            let mut local = self.local.lock().unwrap();
            let was_ready = local.ready;
            if revision > local.revision || (!local.ready && revision >= local.revision) {
                local.revision = revision;
                local.state = state;
                local.ready = true;
                local.in_flight = false;
                (true, !was_ready)
            } else if !local.ready {
                // committed ops already carried us past this snapshot
                local.ready = true;
                (false, true)
            } else {
                (false, false)
            }
        };

        if became_ready {
            self.ready_tx.send_replace(true);
            let _ = self.events.send(ClientEvent::Ready);
        }
        if applied {
            let _ = self.events.send(ClientEvent::Resynced { revision });
            self.dispatch_next().await;
        }
    }

    async fn handle_conflict(&self, revision: u64, state: Value) {
        let (adopted, dropped) = {
            let mut local = self.local.lock().unwrap();
            // a late conflict reply must not roll back past what committed
            // commands already carried us to
            let adopted = revision >= local.revision;
            if adopted {
                local.revision = revision;
                local.state = state;
                local.ready = true;
            }
            local.in_flight = false;
            let dropped = match local.pending.front_mut() {
                Some(front) => {
                    front.retries += 1;
                    if front.retries > self.opts.conflict_retry_limit {
                        local.pending.pop_front();
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            (adopted, dropped)
        };

        if dropped {
            warn!(obj_id = %self.obj_id, "op dropped after conflict retry limit");
            let _ = self.events.send(ClientEvent::OpFailed {
                reason: "conflict retry limit reached".to_string(),
            });
        }
        if adopted {
            self.ready_tx.send_replace(true);
            let _ = self.events.send(ClientEvent::Resynced { revision });
        }
        self.dispatch_next().await;
    }

    /// Hand the front of the queue to the transport, re-based on the
    /// current revision.
    async fn dispatch_next(&self) {
        let cmd = {
            let mut local = self.local.lock().unwrap();
            if local.in_flight {
                None
            } else {
                match local.pending.front() {
                    Some(front) => {
                        let cmd = Command::Update(ClientCommand {
                            obj_id: self.obj_id.clone(),
                            client_id: self.client_id.clone(),
                            base_revision: local.revision,
                            op: front.op.clone(),
                        });
                        local.in_flight = true;
                        Some(cmd)
                    }
                    None => None,
                }
            }
        };
        let Some(cmd) = cmd else { return };
        if let Err(e) = self.transport.send(&[cmd]).await {
            debug!(obj_id = %self.obj_id, "dispatch failed, will retry after reconnect: {}", e);
            self.local.lock().unwrap().in_flight = false;
        }
    }

    async fn send_hello(&self) {
        let revision = self.local.lock().unwrap().revision;
        let hello = Command::Hello {
            obj_id: self.obj_id.clone(),
            client_id: self.client_id.clone(),
            revision,
        };
        if let Err(e) = self.transport.send(&[hello]).await {
            debug!(obj_id = %self.obj_id, "hello failed: {}", e);
        }
    }
}
