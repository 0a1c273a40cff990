//! Persistent store using Fjall LSM-tree.
//!
//! Three partitions: `objects` (JSON rows keyed by `obj_id`), `connections`
//! (bincode rows keyed by `obj_id + client_id`), and `connections_by_socket`
//! (the same rows keyed by `socket_id + obj_id + client_id`, maintained as a
//! secondary index on every write and delete). A store-level mutex
//! serializes the compare-and-swap read-modify-write and keeps the index
//! partitions consistent with each other.
//!
//! Ids must not contain the 0x1f key separator.

use crate::error::StoreError;
use crate::object::{ClientConnection, SyncedObject};
use crate::store::{CasOutcome, ConnectionStore, CreateOutcome, Result, StateStore};
use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use std::path::Path;
use tokio::sync::Mutex;

const KEY_SEP: u8 = 0x1f;

/// Fjall-backed implementation of both store traits.
pub struct PersistentStore {
    keyspace: Keyspace,
    objects: PartitionHandle,
    connections: PartitionHandle,
    by_socket: PartitionHandle,
    write_lock: Mutex<()>,
}

fn conn_key(obj_id: &str, client_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(obj_id.len() + client_id.len() + 1);
    key.extend_from_slice(obj_id.as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(client_id.as_bytes());
    key
}

fn socket_key(socket_id: &str, obj_id: &str, client_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(socket_id.len() + obj_id.len() + client_id.len() + 2);
    key.extend_from_slice(socket_id.as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(obj_id.as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(client_id.as_bytes());
    key
}

fn prefix_of(id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(id.len() + 1);
    prefix.extend_from_slice(id.as_bytes());
    prefix.push(KEY_SEP);
    prefix
}

impl PersistentStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let keyspace = Config::new(path)
            .open()
            .map_err(|e| StoreError::Backend(format!("open keyspace: {}", e)))?;

        let objects = keyspace
            .open_partition("objects", PartitionCreateOptions::default())
            .map_err(|e| StoreError::Backend(format!("open objects partition: {}", e)))?;
        let connections = keyspace
            .open_partition("connections", PartitionCreateOptions::default())
            .map_err(|e| StoreError::Backend(format!("open connections partition: {}", e)))?;
        let by_socket = keyspace
            .open_partition("connections_by_socket", PartitionCreateOptions::default())
            .map_err(|e| StoreError::Backend(format!("open socket index partition: {}", e)))?;

        tracing::debug!("opened persistent store at {:?}", path);
        Ok(Self {
            keyspace,
            objects,
            connections,
            by_socket,
            write_lock: Mutex::new(()),
        })
    }

    /// Flush all partitions to disk.
    pub fn persist(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|e| StoreError::Backend(format!("persist: {}", e)))
    }

    fn read_object(&self, obj_id: &str) -> Result<Option<SyncedObject>> {
        let raw = self
            .objects
            .get(obj_id.as_bytes())
            .map_err(|e| StoreError::Backend(format!("object get: {}", e)))?;
        match raw {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn write_object(&self, obj: &SyncedObject) -> Result<()> {
        let raw = serde_json::to_vec(obj).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.objects
            .insert(obj.obj_id.as_bytes(), raw)
            .map_err(|e| StoreError::Backend(format!("object put: {}", e)))
    }

    fn write_connection(&self, conn: &ClientConnection) -> Result<()> {
        let raw = bincode::serialize(conn).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.connections
            .insert(conn_key(&conn.obj_id, &conn.client_id), &raw)
            .map_err(|e| StoreError::Backend(format!("connection put: {}", e)))?;
        self.by_socket
            .insert(socket_key(&conn.socket_id, &conn.obj_id, &conn.client_id), &raw)
            .map_err(|e| StoreError::Backend(format!("socket index put: {}", e)))
    }

    fn delete_connection(&self, conn: &ClientConnection) -> Result<()> {
        self.connections
            .remove(conn_key(&conn.obj_id, &conn.client_id))
            .map_err(|e| StoreError::Backend(format!("connection remove: {}", e)))?;
        self.by_socket
            .remove(socket_key(&conn.socket_id, &conn.obj_id, &conn.client_id))
            .map_err(|e| StoreError::Backend(format!("socket index remove: {}", e)))
    }

    fn scan_connections(
        &self,
        partition: &PartitionHandle,
        prefix: &[u8],
    ) -> Result<Vec<ClientConnection>> {
        let mut rows = Vec::new();
        for entry in partition.prefix(prefix) {
            let (_, value) =
                entry.map_err(|e| StoreError::Backend(format!("prefix scan: {}", e)))?;
            let conn: ClientConnection = bincode::deserialize(&value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            rows.push(conn);
        }
        Ok(rows)
    }
}

#[async_trait]
impl StateStore for PersistentStore {
    async fn get(&self, obj_id: &str) -> Result<Option<SyncedObject>> {
        self.read_object(obj_id)
    }

    async fn create(&self, obj: SyncedObject) -> Result<CreateOutcome> {
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.read_object(&obj.obj_id)? {
            return Ok(CreateOutcome::Exists(existing));
        }
        self.write_object(&obj)?;
        Ok(CreateOutcome::Created)
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        updated: SyncedObject,
    ) -> Result<CasOutcome> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .read_object(&updated.obj_id)?
            .ok_or_else(|| StoreError::NotFound(updated.obj_id.clone()))?;
        if current.revision != expected_revision {
            return Ok(CasOutcome::Conflict(current));
        }
        self.write_object(&updated)?;
        Ok(CasOutcome::Committed)
    }

    async fn delete(&self, obj_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.objects
            .remove(obj_id.as_bytes())
            .map_err(|e| StoreError::Backend(format!("object remove: {}", e)))
    }
}

#[async_trait]
impl ConnectionStore for PersistentStore {
    async fn put(&self, conn: ClientConnection) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        // a reconnect replaces the previous socket row; drop its index entry
        if let Some(old) = self.lookup(&conn.obj_id, &conn.client_id)? {
            if old.socket_id != conn.socket_id {
                self.by_socket
                    .remove(socket_key(&old.socket_id, &old.obj_id, &old.client_id))
                    .map_err(|e| StoreError::Backend(format!("socket index remove: {}", e)))?;
            }
        }
        self.write_connection(&conn)
    }

    async fn get(&self, obj_id: &str, client_id: &str) -> Result<Option<ClientConnection>> {
        self.lookup(obj_id, client_id)
    }

    async fn list_for_object(&self, obj_id: &str) -> Result<Vec<ClientConnection>> {
        self.scan_connections(&self.connections, &prefix_of(obj_id))
    }

    async fn find_by_socket(&self, socket_id: &str) -> Result<Vec<ClientConnection>> {
        self.scan_connections(&self.by_socket, &prefix_of(socket_id))
    }

    async fn remove(&self, obj_id: &str, client_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(conn) = self.lookup(obj_id, client_id)? {
            self.delete_connection(&conn)?;
        }
        Ok(())
    }

    async fn remove_socket(&self, socket_id: &str) -> Result<Vec<ClientConnection>> {
        let _guard = self.write_lock.lock().await;
        let rows = self.scan_connections(&self.by_socket, &prefix_of(socket_id))?;
        for conn in &rows {
            self.delete_connection(conn)?;
        }
        Ok(rows)
    }

    async fn touch_ping(&self, socket_id: &str, at: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let rows = self.scan_connections(&self.by_socket, &prefix_of(socket_id))?;
        for mut conn in rows {
            conn.last_ping_at = at;
            self.write_connection(&conn)?;
        }
        Ok(())
    }
}

impl PersistentStore {
    fn lookup(&self, obj_id: &str, client_id: &str) -> Result<Option<ClientConnection>> {
        let raw = self
            .connections
            .get(conn_key(obj_id, client_id))
            .map_err(|e| StoreError::Backend(format!("connection get: {}", e)))?;
        match raw {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_object_round_trip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let store = PersistentStore::open(dir.path()).unwrap();
        let mut obj = SyncedObject::new("doc1", json!({}));
        obj.apply(
            "a",
            crate::op::Op::Set {
                path: vec![crate::op::PathSeg::Key("x".into())],
                value: json!(1),
            },
            8,
        )
        .unwrap();
        store.create(obj.clone()).await.unwrap();
        store.persist().unwrap();
        drop(store);

        let store = PersistentStore::open(dir.path()).unwrap();
        let loaded = StateStore::get(&store, "doc1").await.unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.state, json!({"x": 1}));
        assert_eq!(loaded.log.len(), 1);
    }

    #[tokio::test]
    async fn test_cas_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        store
            .create(SyncedObject::new("doc1", json!({})))
            .await
            .unwrap();

        let mut winner = StateStore::get(&store, "doc1").await.unwrap().unwrap();
        winner.revision = 1;
        let mut loser = StateStore::get(&store, "doc1").await.unwrap().unwrap();
        loser.revision = 1;

        assert!(matches!(
            store.compare_and_swap(0, winner).await.unwrap(),
            CasOutcome::Committed
        ));
        assert!(matches!(
            store.compare_and_swap(0, loser).await.unwrap(),
            CasOutcome::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_socket_index_follows_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();

        store
            .put(ClientConnection::new("doc1", "a", "sock-1", None))
            .await
            .unwrap();
        store
            .put(ClientConnection::new("doc1", "a", "sock-2", None))
            .await
            .unwrap();

        assert!(store.find_by_socket("sock-1").await.unwrap().is_empty());
        let rows = store.find_by_socket("sock-2").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].client_id, "a");
        assert_eq!(store.list_for_object("doc1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_socket_clears_both_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();

        store
            .put(ClientConnection::new("doc1", "a", "sock-1", None))
            .await
            .unwrap();
        store
            .put(ClientConnection::new("doc2", "b", "sock-1", None))
            .await
            .unwrap();

        let removed = store.remove_socket("sock-1").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.find_by_socket("sock-1").await.unwrap().is_empty());
        assert!(store.list_for_object("doc1").await.unwrap().is_empty());
        assert!(store.list_for_object("doc2").await.unwrap().is_empty());
    }
}
