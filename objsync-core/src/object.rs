//! Synced object and client connection records.
//!
//! These are the only durable records in the system: `SyncedObject` is the
//! authoritative state of one logical object, `ClientConnection` is one
//! client's membership in that object's synchronization group. All
//! cross-instance coordination happens through them.

use crate::command::RemoteCommand;
use crate::op::{Op, OpError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One committed op retained for catch-up replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedOp {
    pub revision: u64,
    pub origin_client_id: String,
    pub op: Op,
}

/// Authoritative state for one logical object.
///
/// Exactly one record exists per `obj_id`; `revision` starts at 0 on
/// creation and only increases. State at revision N is fully determined by
/// state at N-1 plus the op that produced N.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedObject {
    pub obj_id: String,
    pub revision: u64,
    pub state: Value,
    /// Unix seconds of the last committed write.
    pub updated_at: i64,
    /// Most recent committed ops, trimmed to the replay window.
    #[serde(default)]
    pub log: Vec<LoggedOp>,
    /// Path to an object whose keys are the ids of connected clients.
    #[serde(default)]
    pub client_map_prop: Option<String>,
    /// Remove a client's entry under `client_map_prop` when it disconnects.
    #[serde(default)]
    pub auto_delete_client_objects: bool,
}

impl SyncedObject {
    /// Create a fresh object at revision 0.
    pub fn new(obj_id: impl Into<String>, state: Value) -> Self {
        Self {
            obj_id: obj_id.into(),
            revision: 0,
            state,
            updated_at: chrono::Utc::now().timestamp(),
            log: Vec::new(),
            client_map_prop: None,
            auto_delete_client_objects: false,
        }
    }

    /// Apply one op, producing the next revision and the remote command to
    /// fan out. The record is untouched when the op fails to apply.
    pub fn apply(
        &mut self,
        origin_client_id: &str,
        op: Op,
        replay_window: usize,
    ) -> Result<RemoteCommand, OpError> {
        let mut next = self.state.clone();
        op.apply(&mut next)?;

        self.state = next;
        self.revision += 1;
        self.updated_at = chrono::Utc::now().timestamp();
        self.log.push(LoggedOp {
            revision: self.revision,
            origin_client_id: origin_client_id.to_string(),
            op: op.clone(),
        });
        if self.log.len() > replay_window {
            let excess = self.log.len() - replay_window;
            self.log.drain(..excess);
        }

        Ok(RemoteCommand {
            obj_id: self.obj_id.clone(),
            origin_client_id: origin_client_id.to_string(),
            revision: self.revision,
            op,
        })
    }

    /// Remote commands replaying everything after `revision`, or `None`
    /// when the log no longer covers that range (caller falls back to a
    /// full snapshot).
    pub fn replay_from(&self, revision: u64) -> Option<Vec<RemoteCommand>> {
        if revision >= self.revision {
            return Some(Vec::new());
        }
        let first_logged = self.log.first().map(|entry| entry.revision)?;
        if revision + 1 < first_logged {
            return None;
        }
        Some(
            self.log
                .iter()
                .filter(|entry| entry.revision > revision)
                .map(|entry| RemoteCommand {
                    obj_id: self.obj_id.clone(),
                    origin_client_id: entry.origin_client_id.clone(),
                    revision: entry.revision,
                    op: entry.op.clone(),
                })
                .collect(),
        )
    }
}

/// One client's membership in an object's synchronization group.
///
/// `(obj_id, client_id)` uniquely identifies the subscription and maps to
/// at most one live `socket_id` at a time. Inbound transport events carry
/// only `socket_id`, so the registry must support lookup by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConnection {
    pub obj_id: String,
    pub client_id: String,
    pub socket_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Unix seconds when the connection was registered.
    pub connected_at: i64,
    /// Unix seconds of the last registered ping.
    pub last_ping_at: i64,
}

impl ClientConnection {
    pub fn new(
        obj_id: impl Into<String>,
        client_id: impl Into<String>,
        socket_id: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            obj_id: obj_id.into(),
            client_id: client_id.into(),
            socket_id: socket_id.into(),
            user_id,
            connected_at: now,
            last_ping_at: now,
        }
    }
}
