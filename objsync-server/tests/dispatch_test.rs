//! Integration tests for the dispatch service.
//!
//! Uses the in-memory stores and a recording sender so every reply and
//! fan-out delivery can be asserted per socket.

use async_trait::async_trait;
use objsync_core::{
    ClientCommand, Command, ConnectionRejected, ConnectionStore, DeliveryFailure,
    MemoryConnectionStore, MemoryStateStore, Op, PathSeg, StateStore,
};
use objsync_server::{
    CommandSender, ConnectionAccept, ConnectionRequest, ConnectionTransformer,
    DefaultStateProvider, DispatchService, NewObject,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<(String, Vec<Command>)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingSender {
    fn fail_socket(&self, socket_id: &str) {
        self.failing.lock().unwrap().insert(socket_id.to_string());
    }

    fn sent_to(&self, socket_id: &str) -> Vec<Command> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(sid, _)| sid == socket_id)
            .flat_map(|(_, batch)| batch.clone())
            .collect()
    }

    fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl CommandSender for RecordingSender {
    async fn send(&self, socket_id: &str, commands: &[Command]) -> Result<(), DeliveryFailure> {
        if self.failing.lock().unwrap().contains(socket_id) {
            return Err(DeliveryFailure {
                socket_id: socket_id.to_string(),
                reason: "stale socket".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((socket_id.to_string(), commands.to_vec()));
        Ok(())
    }
}

struct Harness {
    states: Arc<MemoryStateStore>,
    connections: Arc<MemoryConnectionStore>,
    sender: Arc<RecordingSender>,
    dispatch: DispatchService,
}

fn harness() -> Harness {
    let states = Arc::new(MemoryStateStore::new());
    let connections = Arc::new(MemoryConnectionStore::new());
    let sender = Arc::new(RecordingSender::default());
    let dispatch = DispatchService::new(states.clone(), connections.clone(), sender.clone());
    Harness {
        states,
        connections,
        sender,
        dispatch,
    }
}

fn hello(obj: &str, client: &str, revision: u64) -> Command {
    Command::Hello {
        obj_id: obj.to_string(),
        client_id: client.to_string(),
        revision,
    }
}

fn set_update(obj: &str, client: &str, base: u64, prop: &str, value: Value) -> Command {
    Command::Update(ClientCommand {
        obj_id: obj.to_string(),
        client_id: client.to_string(),
        base_revision: base,
        op: Op::Set {
            path: vec![PathSeg::Key(prop.to_string())],
            value,
        },
    })
}

fn remotes(commands: &[Command]) -> Vec<(u64, String)> {
    commands
        .iter()
        .filter_map(|cmd| match cmd {
            Command::Remote(remote) => Some((remote.revision, remote.origin_client_id.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_first_hello_creates_object_and_snapshots() {
    let h = harness();
    h.dispatch
        .handle_message("sock-a", None, vec![hello("doc1", "a", 0)])
        .await
        .unwrap();

    let obj = h.states.get("doc1").await.unwrap().unwrap();
    assert_eq!(obj.revision, 0);
    assert_eq!(obj.state, json!({}));

    let conn = h.connections.get("doc1", "a").await.unwrap().unwrap();
    assert_eq!(conn.socket_id, "sock-a");

    let sent = h.sender.sent_to("sock-a");
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Command::Snapshot {
            obj_id,
            revision,
            state,
        } => {
            assert_eq!(obj_id, "doc1");
            assert_eq!(*revision, 0);
            assert_eq!(*state, json!({}));
        }
        other => panic!("expected snapshot, got {:?}", other),
    }
}

// The canonical concurrent-writer scenario: A wins at base 0, B conflicts,
// B retries against the returned revision and both converge.
#[tokio::test]
async fn test_same_base_writers_one_wins_one_conflicts() {
    let h = harness();
    h.dispatch
        .handle_message("sock-a", None, vec![hello("doc1", "a", 0)])
        .await
        .unwrap();
    h.dispatch
        .handle_message("sock-b", None, vec![hello("doc1", "b", 0)])
        .await
        .unwrap();
    h.sender.clear();

    h.dispatch
        .handle_message("sock-a", None, vec![set_update("doc1", "a", 0, "x", json!(1))])
        .await
        .unwrap();

    // committed at revision 1 and fanned out to both, originator included
    assert_eq!(remotes(&h.sender.sent_to("sock-a")), vec![(1, "a".into())]);
    assert_eq!(remotes(&h.sender.sent_to("sock-b")), vec![(1, "a".into())]);

    h.dispatch
        .handle_message("sock-b", None, vec![set_update("doc1", "b", 0, "y", json!(2))])
        .await
        .unwrap();

    let to_b = h.sender.sent_to("sock-b");
    match to_b.last().unwrap() {
        Command::Conflict {
            revision, state, ..
        } => {
            assert_eq!(*revision, 1);
            assert_eq!(*state, json!({"x": 1}));
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    // the conflict reply went only to the originator
    assert_eq!(remotes(&h.sender.sent_to("sock-a")), vec![(1, "a".into())]);

    h.dispatch
        .handle_message("sock-b", None, vec![set_update("doc1", "b", 1, "y", json!(2))])
        .await
        .unwrap();

    let obj = h.states.get("doc1").await.unwrap().unwrap();
    assert_eq!(obj.revision, 2);
    assert_eq!(obj.state, json!({"x": 1, "y": 2}));
    assert_eq!(
        remotes(&h.sender.sent_to("sock-a")),
        vec![(1, "a".into()), (2, "b".into())]
    );
    assert_eq!(
        remotes(&h.sender.sent_to("sock-b")),
        vec![(1, "a".into()), (2, "b".into())]
    );
}

#[tokio::test]
async fn test_hello_at_current_revision_sends_nothing() {
    let h = harness();
    h.dispatch
        .handle_message("sock-a", None, vec![hello("doc1", "a", 0)])
        .await
        .unwrap();
    h.dispatch
        .handle_message("sock-a", None, vec![set_update("doc1", "a", 0, "x", json!(1))])
        .await
        .unwrap();
    h.sender.clear();

    h.dispatch
        .handle_message("sock-a", None, vec![hello("doc1", "a", 1)])
        .await
        .unwrap();

    assert!(h.sender.sent_to("sock-a").is_empty());
}

#[tokio::test]
async fn test_hello_behind_within_window_replays() {
    let h = harness();
    h.dispatch
        .handle_message("sock-a", None, vec![hello("doc1", "a", 0)])
        .await
        .unwrap();
    for i in 0..3 {
        h.dispatch
            .handle_message(
                "sock-a",
                None,
                vec![set_update("doc1", "a", i, "n", json!(i))],
            )
            .await
            .unwrap();
    }
    h.sender.clear();

    h.dispatch
        .handle_message("sock-b", None, vec![hello("doc1", "b", 1)])
        .await
        .unwrap();

    let sent = h.sender.sent_to("sock-b");
    assert!(sent.iter().all(|c| matches!(c, Command::Remote(_))));
    assert_eq!(remotes(&sent), vec![(2, "a".into()), (3, "a".into())]);
}

#[tokio::test]
async fn test_hello_beyond_window_gets_snapshot() {
    let states = Arc::new(MemoryStateStore::new());
    let connections = Arc::new(MemoryConnectionStore::new());
    let sender = Arc::new(RecordingSender::default());
    let dispatch = DispatchService::new(states.clone(), connections, sender.clone())
        .with_replay_window(2);

    dispatch
        .handle_message("sock-a", None, vec![hello("doc1", "a", 0)])
        .await
        .unwrap();
    for i in 0..6 {
        dispatch
            .handle_message(
                "sock-a",
                None,
                vec![set_update("doc1", "a", i, "n", json!(i))],
            )
            .await
            .unwrap();
    }
    sender.clear();

    dispatch
        .handle_message("sock-b", None, vec![hello("doc1", "b", 1)])
        .await
        .unwrap();

    let sent = sender.sent_to("sock-b");
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Command::Snapshot { revision, state, .. } => {
            assert_eq!(*revision, 6);
            assert_eq!(*state, json!({"n": 5}));
        }
        other => panic!("expected snapshot, got {:?}", other),
    }
}

#[tokio::test]
async fn test_delivery_failure_prunes_only_that_connection() {
    let h = harness();
    for (sock, client) in [("sock-a", "a"), ("sock-b", "b"), ("sock-c", "c")] {
        h.dispatch
            .handle_message(sock, None, vec![hello("doc1", client, 0)])
            .await
            .unwrap();
    }
    h.sender.fail_socket("sock-b");
    h.sender.clear();

    h.dispatch
        .handle_message("sock-a", None, vec![set_update("doc1", "a", 0, "x", json!(1))])
        .await
        .unwrap();

    // the other recipients still got the command
    assert_eq!(remotes(&h.sender.sent_to("sock-a")), vec![(1, "a".into())]);
    assert_eq!(remotes(&h.sender.sent_to("sock-c")), vec![(1, "a".into())]);

    // the failed connection row is gone; the rest remain
    assert!(h.connections.get("doc1", "b").await.unwrap().is_none());
    assert_eq!(h.connections.list_for_object("doc1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_disconnect_removes_socket_rows() {
    let h = harness();
    h.dispatch
        .handle_message("sock-a", None, vec![hello("doc1", "a", 0), hello("doc2", "a", 0)])
        .await
        .unwrap();
    h.dispatch
        .handle_message("sock-b", None, vec![hello("doc1", "b", 0)])
        .await
        .unwrap();

    h.dispatch.handle_disconnect("sock-a").await.unwrap();

    assert!(h.connections.find_by_socket("sock-a").await.unwrap().is_empty());
    assert_eq!(h.connections.list_for_object("doc1").await.unwrap().len(), 1);
    assert!(h.connections.list_for_object("doc2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ping_registered_and_unregistered() {
    let h = harness();

    // a ping from a socket with no rows gets told to re-hello
    h.dispatch
        .handle_message(
            "sock-a",
            None,
            vec![Command::Ping {
                obj_id: "doc1".into(),
                client_id: "a".into(),
            }],
        )
        .await
        .unwrap();
    assert!(matches!(
        h.sender.sent_to("sock-a")[0],
        Command::Resync { .. }
    ));

    h.dispatch
        .handle_message("sock-a", None, vec![hello("doc1", "a", 0)])
        .await
        .unwrap();
    h.sender.clear();

    h.dispatch
        .handle_message(
            "sock-a",
            None,
            vec![Command::Ping {
                obj_id: "doc1".into(),
                client_id: "a".into(),
            }],
        )
        .await
        .unwrap();
    assert!(matches!(h.sender.sent_to("sock-a")[0], Command::Pong { .. }));
}

#[tokio::test]
async fn test_update_for_unknown_object_requests_resync() {
    let h = harness();
    h.dispatch
        .handle_message("sock-a", None, vec![set_update("ghost", "a", 0, "x", json!(1))])
        .await
        .unwrap();

    assert!(matches!(
        h.sender.sent_to("sock-a")[0],
        Command::Resync { .. }
    ));
    assert!(h.states.get("ghost").await.unwrap().is_none());
}

struct DenyClient {
    denied: &'static str,
}

#[async_trait]
impl ConnectionTransformer for DenyClient {
    async fn transform(
        &self,
        request: ConnectionRequest,
    ) -> Result<ConnectionAccept, ConnectionRejected> {
        if request.client_id == self.denied {
            return Err(ConnectionRejected {
                reason: "unauthorized".to_string(),
            });
        }
        Ok(ConnectionAccept {
            client_id: format!("user:{}", request.client_id),
            user_id: request.user_id,
        })
    }
}

#[tokio::test]
async fn test_transformer_rejects_and_enriches() {
    let states = Arc::new(MemoryStateStore::new());
    let connections = Arc::new(MemoryConnectionStore::new());
    let sender = Arc::new(RecordingSender::default());
    let dispatch = DispatchService::new(states, connections.clone(), sender.clone())
        .with_transformer(Arc::new(DenyClient { denied: "evil" }));

    dispatch
        .handle_message("sock-e", None, vec![hello("doc1", "evil", 0)])
        .await
        .unwrap();
    match &sender.sent_to("sock-e")[0] {
        Command::Rejected { reason, .. } => assert_eq!(reason, "unauthorized"),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(connections.list_for_object("doc1").await.unwrap().is_empty());

    dispatch
        .handle_message("sock-a", None, vec![hello("doc1", "a", 0)])
        .await
        .unwrap();
    // the registry row carries the enriched identity
    assert!(connections.get("doc1", "user:a").await.unwrap().is_some());
}

struct PresenceObjects;

#[async_trait]
impl DefaultStateProvider for PresenceObjects {
    async fn provide(&self, _obj_id: &str) -> Result<NewObject, String> {
        Ok(NewObject {
            state: json!({"presence": {}}),
            client_map_prop: Some("presence".to_string()),
            auto_delete_client_objects: true,
        })
    }
}

#[tokio::test]
async fn test_presence_entry_deleted_on_disconnect() {
    let states = Arc::new(MemoryStateStore::new());
    let connections = Arc::new(MemoryConnectionStore::new());
    let sender = Arc::new(RecordingSender::default());
    let dispatch = DispatchService::new(states.clone(), connections, sender.clone())
        .with_default_state(Arc::new(PresenceObjects));

    dispatch
        .handle_message("sock-a", None, vec![hello("doc1", "a", 0)])
        .await
        .unwrap();
    dispatch
        .handle_message("sock-b", None, vec![hello("doc1", "b", 0)])
        .await
        .unwrap();

    // client A announces itself in the presence map
    dispatch
        .handle_message(
            "sock-a",
            None,
            vec![Command::Update(ClientCommand {
                obj_id: "doc1".into(),
                client_id: "a".into(),
                base_revision: 0,
                op: Op::Set {
                    path: vec![PathSeg::Key("presence".into()), PathSeg::Key("a".into())],
                    value: json!({"online": true}),
                },
            })],
        )
        .await
        .unwrap();
    sender.clear();

    dispatch.handle_disconnect("sock-a").await.unwrap();

    let obj = states.get("doc1").await.unwrap().unwrap();
    assert_eq!(obj.revision, 2);
    assert_eq!(obj.state, json!({"presence": {}}));

    // the surviving peer saw the deletion as a normal committed op
    let to_b = sender.sent_to("sock-b");
    assert_eq!(remotes(&to_b), vec![(2, "a".into())]);
}
