//! Wire command types for the sync protocol.
//!
//! Commands travel as JSON arrays so a single frame can batch client and
//! remote variants together. `Update` is the pre-application form of a
//! mutation (expressed against the revision its author last observed) and
//! `Remote` is the post-application form broadcast to every subscriber.

use crate::op::Op;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version advertised by the server at startup.
pub const PROTOCOL_VERSION: u32 = 1;

/// A client's proposed mutation, expressed against the revision it last
/// observed. The server's compare-and-swap gate accepts it only when
/// `base_revision` still matches the stored revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCommand {
    pub obj_id: String,
    pub client_id: String,
    pub base_revision: u64,
    pub op: Op,
}

/// The result of a committed mutation, fanned out to every connection
/// registered for the object (the originator included).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommand {
    pub obj_id: String,
    pub origin_client_id: String,
    pub revision: u64,
    pub op: Op,
}

/// Every message that can appear in a wire batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Subscribe/catch-up request carrying the last locally observed
    /// revision (0 if none).
    #[serde(rename_all = "camelCase")]
    Hello {
        obj_id: String,
        client_id: String,
        revision: u64,
    },

    /// Proposed mutation (client to server).
    Update(ClientCommand),

    /// Committed mutation (server to clients).
    Remote(RemoteCommand),

    /// Full-state delivery for clients that are new or beyond the replay
    /// window.
    #[serde(rename_all = "camelCase")]
    Snapshot {
        obj_id: String,
        revision: u64,
        state: Value,
    },

    /// Compare-and-swap rejection carrying the authoritative current
    /// revision and state so the originator can resync and retry.
    #[serde(rename_all = "camelCase")]
    Conflict {
        obj_id: String,
        revision: u64,
        state: Value,
    },

    /// The connection transformer declined this connection.
    #[serde(rename_all = "camelCase")]
    Rejected { obj_id: String, reason: String },

    /// Liveness probe.
    #[serde(rename_all = "camelCase")]
    Ping { obj_id: String, client_id: String },

    /// Liveness reply.
    #[serde(rename_all = "camelCase")]
    Pong { obj_id: String, client_id: String },

    /// Server instruction to re-send `Hello` (e.g. the socket has no
    /// registered connection anymore).
    #[serde(rename_all = "camelCase")]
    Resync { obj_id: String },
}

/// Encode a batch of commands as one JSON wire frame.
pub fn encode_batch(commands: &[Command]) -> Result<String, serde_json::Error> {
    serde_json::to_string(commands)
}

/// Decode a wire frame into a batch of commands.
///
/// Accepts both a JSON array and a bare single command.
pub fn decode_batch(raw: &str) -> Result<Vec<Command>, serde_json::Error> {
    match serde_json::from_str::<Vec<Command>>(raw) {
        Ok(batch) => Ok(batch),
        Err(_) => serde_json::from_str::<Command>(raw).map(|cmd| vec![cmd]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::PathSeg;
    use serde_json::json;

    fn update() -> Command {
        Command::Update(ClientCommand {
            obj_id: "doc1".into(),
            client_id: "a".into(),
            base_revision: 0,
            op: Op::Set {
                path: vec![PathSeg::Key("x".into())],
                value: json!(1),
            },
        })
    }

    #[test]
    fn test_batch_round_trip() {
        let batch = vec![
            Command::Hello {
                obj_id: "doc1".into(),
                client_id: "a".into(),
                revision: 0,
            },
            update(),
            Command::Ping {
                obj_id: "doc1".into(),
                client_id: "a".into(),
            },
        ];
        let raw = encode_batch(&batch).unwrap();
        let decoded = decode_batch(&raw).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_decode_single_command() {
        let raw = serde_json::to_string(&update()).unwrap();
        let decoded = decode_batch(&raw).unwrap();
        assert_eq!(decoded, vec![update()]);
    }

    #[test]
    fn test_update_wire_shape() {
        let raw = serde_json::to_string(&update()).unwrap();
        assert_eq!(
            raw,
            r#"{"type":"update","objId":"doc1","clientId":"a","baseRevision":0,"op":{"type":"set","path":["x"],"value":1}}"#
        );
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_batch("not json").is_err());
        assert!(decode_batch(r#"{"type":"warp"}"#).is_err());
    }
}
