//! Server dispatch service.
//!
//! Consulted on every inbound command and connection lifecycle event. Each
//! invocation is independent: coordination happens entirely through the
//! state store's compare-and-swap gate and the connection registry, so any
//! number of dispatch instances can run concurrently against the same
//! stores. Writes to one object are totally ordered; different objects are
//! fully independent.

use crate::error::DispatchError;
use async_trait::async_trait;
use futures::future::join_all;
use objsync_core::{
    CasOutcome, ClientCommand, ClientConnection, Command, ConnectionRejected, ConnectionStore,
    CreateOutcome, DeliveryFailure, Op, PathSeg, RemoteCommand, StateStore, SyncedObject,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Send-to-socket-by-id primitive (the transport's management API).
/// Fire-and-forget per recipient: a failure only concerns that socket.
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send(&self, socket_id: &str, commands: &[Command]) -> Result<(), DeliveryFailure>;
}

/// Template for a never-seen object, produced by the default-state
/// provider on first connection.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub state: Value,
    pub client_map_prop: Option<String>,
    pub auto_delete_client_objects: bool,
}

impl NewObject {
    pub fn with_state(state: Value) -> Self {
        Self {
            state,
            client_map_prop: None,
            auto_delete_client_objects: false,
        }
    }
}

/// Produces the initial record for a never-seen object. Creation itself is
/// CAS-protected, so concurrent first connections converge on one record
/// even if the provider is called more than once.
#[async_trait]
pub trait DefaultStateProvider: Send + Sync {
    async fn provide(&self, obj_id: &str) -> Result<NewObject, String>;
}

/// Default provider: every object starts as an empty JSON object.
pub struct EmptyDefaultState;

#[async_trait]
impl DefaultStateProvider for EmptyDefaultState {
    async fn provide(&self, _obj_id: &str) -> Result<NewObject, String> {
        Ok(NewObject::with_state(Value::Object(Map::new())))
    }
}

/// A new connection before the transformer has seen it.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub obj_id: String,
    pub client_id: String,
    pub socket_id: String,
    pub user_id: Option<String>,
}

/// Transformer verdict: the (possibly enriched) identity to register.
#[derive(Debug, Clone)]
pub struct ConnectionAccept {
    pub client_id: String,
    pub user_id: Option<String>,
}

/// Validates/enriches every new connection before its registry row is
/// created. Rejection is terminal for the attempt and surfaced explicitly.
#[async_trait]
pub trait ConnectionTransformer: Send + Sync {
    async fn transform(
        &self,
        request: ConnectionRequest,
    ) -> Result<ConnectionAccept, ConnectionRejected>;
}

/// Default transformer: accept everyone as they claim to be.
pub struct AcceptAllConnections;

#[async_trait]
impl ConnectionTransformer for AcceptAllConnections {
    async fn transform(
        &self,
        request: ConnectionRequest,
    ) -> Result<ConnectionAccept, ConnectionRejected> {
        Ok(ConnectionAccept {
            client_id: request.client_id,
            user_id: request.user_id,
        })
    }
}

const DEFAULT_REPLAY_WINDOW: usize = 64;

/// The authoritative serialization point for object state.
pub struct DispatchService {
    states: Arc<dyn StateStore>,
    connections: Arc<dyn ConnectionStore>,
    sender: Arc<dyn CommandSender>,
    default_state: Arc<dyn DefaultStateProvider>,
    transformer: Arc<dyn ConnectionTransformer>,
    replay_window: usize,
}

impl DispatchService {
    pub fn new(
        states: Arc<dyn StateStore>,
        connections: Arc<dyn ConnectionStore>,
        sender: Arc<dyn CommandSender>,
    ) -> Self {
        Self {
            states,
            connections,
            sender,
            default_state: Arc::new(EmptyDefaultState),
            transformer: Arc::new(AcceptAllConnections),
            replay_window: DEFAULT_REPLAY_WINDOW,
        }
    }

    pub fn with_default_state(mut self, provider: Arc<dyn DefaultStateProvider>) -> Self {
        self.default_state = provider;
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn ConnectionTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_replay_window(mut self, replay_window: usize) -> Self {
        self.replay_window = replay_window;
        self
    }

    /// Handle one inbound wire batch from a socket.
    pub async fn handle_message(
        &self,
        socket_id: &str,
        user_id: Option<&str>,
        commands: Vec<Command>,
    ) -> Result<(), DispatchError> {
        for cmd in commands {
            match cmd {
                Command::Hello {
                    obj_id,
                    client_id,
                    revision,
                } => {
                    self.on_connect(socket_id, user_id, obj_id, client_id, revision)
                        .await?;
                }
                Command::Update(update) => {
                    self.on_update(socket_id, update).await?;
                }
                Command::Ping { obj_id, client_id } => {
                    self.on_ping(socket_id, obj_id, client_id).await?;
                }
                other => {
                    debug!(socket_id, "ignoring non-client command: {:?}", other);
                }
            }
        }
        Ok(())
    }

    /// Handle a socket-closed event: drop every connection riding the
    /// socket and clean up presence entries where the object asks for it.
    pub async fn handle_disconnect(&self, socket_id: &str) -> Result<(), DispatchError> {
        let removed = self.connections.remove_socket(socket_id).await?;
        for conn in removed {
            debug!(
                socket_id,
                obj_id = %conn.obj_id,
                client_id = %conn.client_id,
                "connection removed"
            );
            let Some(obj) = self.states.get(&conn.obj_id).await? else {
                continue;
            };
            if obj.auto_delete_client_objects {
                if let Some(prop) = obj.client_map_prop.clone() {
                    let op = Op::Delete {
                        path: vec![PathSeg::Key(prop), PathSeg::Key(conn.client_id.clone())],
                    };
                    self.apply_server_op(&conn.obj_id, &conn.client_id, op)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn on_connect(
        &self,
        socket_id: &str,
        user_id: Option<&str>,
        obj_id: String,
        client_id: String,
        revision: u64,
    ) -> Result<(), DispatchError> {
        let request = ConnectionRequest {
            obj_id: obj_id.clone(),
            client_id,
            socket_id: socket_id.to_string(),
            user_id: user_id.map(str::to_string),
        };
        let accept = match self.transformer.transform(request).await {
            Ok(accept) => accept,
            Err(rejected) => {
                info!(socket_id, %obj_id, "connection rejected: {}", rejected.reason);
                let reply = Command::Rejected {
                    obj_id,
                    reason: rejected.reason,
                };
                if let Err(e) = self.sender.send(socket_id, &[reply]).await {
                    debug!(socket_id, "rejection reply undeliverable: {}", e);
                }
                return Ok(());
            }
        };

        let conn = ClientConnection::new(&obj_id, &accept.client_id, socket_id, accept.user_id);
        self.connections.put(conn).await?;

        let obj = self.get_or_create(&obj_id).await?;

        // catch-up: nothing when current, replay when the log covers the
        // distance, full snapshot otherwise (including revision 0)
        let reply: Vec<Command> = if revision == obj.revision && revision > 0 {
            Vec::new()
        } else if revision > 0 && revision < obj.revision {
            match obj.replay_from(revision) {
                Some(commands) => commands.into_iter().map(Command::Remote).collect(),
                None => vec![snapshot_of(&obj)],
            }
        } else {
            vec![snapshot_of(&obj)]
        };

        if !reply.is_empty() {
            if let Err(e) = self.sender.send(socket_id, &reply).await {
                warn!(socket_id, "catch-up undeliverable, pruning: {}", e);
                self.connections.remove(&obj_id, &accept.client_id).await?;
            }
        }
        Ok(())
    }

    async fn on_update(&self, socket_id: &str, cmd: ClientCommand) -> Result<(), DispatchError> {
        let Some(mut obj) = self.states.get(&cmd.obj_id).await? else {
            debug!(socket_id, obj_id = %cmd.obj_id, "update for unknown object");
            let reply = Command::Resync {
                obj_id: cmd.obj_id.clone(),
            };
            if let Err(e) = self.sender.send(socket_id, &[reply]).await {
                debug!(socket_id, "resync reply undeliverable: {}", e);
            }
            return Ok(());
        };

        if cmd.base_revision != obj.revision {
            self.send_conflict(socket_id, &obj).await;
            return Ok(());
        }

        let remote = match obj.apply(&cmd.client_id, cmd.op, self.replay_window) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(socket_id, obj_id = %obj.obj_id, "refusing unappliable op: {}", e);
                self.send_conflict(socket_id, &obj).await;
                return Ok(());
            }
        };

        match self.states.compare_and_swap(cmd.base_revision, obj).await? {
            CasOutcome::Committed => self.fan_out(&remote).await?,
            CasOutcome::Conflict(current) => {
                // another writer won between our read and write
                self.send_conflict(socket_id, &current).await;
            }
        }
        Ok(())
    }

    async fn on_ping(
        &self,
        socket_id: &str,
        obj_id: String,
        client_id: String,
    ) -> Result<(), DispatchError> {
        let rows = self.connections.find_by_socket(socket_id).await?;
        let reply = if rows.is_empty() {
            // the socket outlived its registry rows; tell it to re-hello
            Command::Resync { obj_id }
        } else {
            self.connections
                .touch_ping(socket_id, chrono::Utc::now().timestamp())
                .await?;
            Command::Pong { obj_id, client_id }
        };
        if let Err(e) = self.sender.send(socket_id, &[reply]).await {
            debug!(socket_id, "ping reply undeliverable: {}", e);
        }
        Ok(())
    }

    /// Deliver one committed command to every connection registered for the
    /// object, concurrently. Best-effort per recipient: a failed delivery
    /// prunes that connection and never blocks the rest.
    async fn fan_out(&self, remote: &RemoteCommand) -> Result<(), DispatchError> {
        let recipients = self.connections.list_for_object(&remote.obj_id).await?;
        let batch = [Command::Remote(remote.clone())];

        let sends = recipients.iter().map(|conn| {
            let batch = &batch;
            async move {
                match self.sender.send(&conn.socket_id, batch).await {
                    Ok(()) => None,
                    Err(failure) => Some((conn, failure)),
                }
            }
        });

        for (conn, failure) in join_all(sends).await.into_iter().flatten() {
            warn!(
                socket_id = %conn.socket_id,
                obj_id = %conn.obj_id,
                "delivery failed, pruning connection: {}",
                failure
            );
            self.connections.remove(&conn.obj_id, &conn.client_id).await?;
        }
        Ok(())
    }

    async fn get_or_create(&self, obj_id: &str) -> Result<SyncedObject, DispatchError> {
        if let Some(obj) = self.states.get(obj_id).await? {
            return Ok(obj);
        }
        let template = self
            .default_state
            .provide(obj_id)
            .await
            .map_err(DispatchError::DefaultState)?;
        let mut obj = SyncedObject::new(obj_id, template.state);
        obj.client_map_prop = template.client_map_prop;
        obj.auto_delete_client_objects = template.auto_delete_client_objects;

        match self.states.create(obj.clone()).await? {
            CreateOutcome::Created => {
                info!(obj_id, "created synced object");
                Ok(obj)
            }
            // a concurrent first connection won the race; use its record
            CreateOutcome::Exists(existing) => Ok(existing),
        }
    }

    /// Commit a server-originated op through the normal CAS path, retrying
    /// a few times under contention.
    async fn apply_server_op(
        &self,
        obj_id: &str,
        origin_client_id: &str,
        op: Op,
    ) -> Result<(), DispatchError> {
        for _ in 0..4 {
            let Some(mut obj) = self.states.get(obj_id).await? else {
                return Ok(());
            };
            let base = obj.revision;
            let remote = match obj.apply(origin_client_id, op.clone(), self.replay_window) {
                Ok(remote) => remote,
                Err(e) => {
                    debug!(obj_id, "server op not applicable: {}", e);
                    return Ok(());
                }
            };
            match self.states.compare_and_swap(base, obj).await? {
                CasOutcome::Committed => {
                    self.fan_out(&remote).await?;
                    return Ok(());
                }
                CasOutcome::Conflict(_) => continue,
            }
        }
        warn!(obj_id, "server op abandoned after contention");
        Ok(())
    }

    async fn send_conflict(&self, socket_id: &str, obj: &SyncedObject) {
        let reply = Command::Conflict {
            obj_id: obj.obj_id.clone(),
            revision: obj.revision,
            state: obj.state.clone(),
        };
        if let Err(e) = self.sender.send(socket_id, &[reply]).await {
            debug!(socket_id, "conflict reply undeliverable: {}", e);
        }
    }
}

fn snapshot_of(obj: &SyncedObject) -> Command {
    Command::Snapshot {
        obj_id: obj.obj_id.clone(),
        revision: obj.revision,
        state: obj.state.clone(),
    }
}
