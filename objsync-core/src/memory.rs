//! In-memory stores for tests and single-process deployments.

use crate::error::StoreError;
use crate::object::{ClientConnection, SyncedObject};
use crate::store::{CasOutcome, ConnectionStore, CreateOutcome, Result, StateStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Object-state store backed by a map; the write lock is the CAS gate.
#[derive(Default)]
pub struct MemoryStateStore {
    objects: Arc<RwLock<HashMap<String, SyncedObject>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, obj_id: &str) -> Result<Option<SyncedObject>> {
        Ok(self.objects.read().await.get(obj_id).cloned())
    }

    async fn create(&self, obj: SyncedObject) -> Result<CreateOutcome> {
        let mut objects = self.objects.write().await;
        if let Some(existing) = objects.get(&obj.obj_id) {
            return Ok(CreateOutcome::Exists(existing.clone()));
        }
        objects.insert(obj.obj_id.clone(), obj);
        Ok(CreateOutcome::Created)
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        updated: SyncedObject,
    ) -> Result<CasOutcome> {
        let mut objects = self.objects.write().await;
        let current = objects
            .get(&updated.obj_id)
            .ok_or_else(|| StoreError::NotFound(updated.obj_id.clone()))?;
        if current.revision != expected_revision {
            return Ok(CasOutcome::Conflict(current.clone()));
        }
        objects.insert(updated.obj_id.clone(), updated);
        Ok(CasOutcome::Committed)
    }

    async fn delete(&self, obj_id: &str) -> Result<()> {
        self.objects.write().await.remove(obj_id);
        Ok(())
    }
}

/// Connection registry backed by a map keyed by `(obj_id, client_id)`.
#[derive(Default)]
pub struct MemoryConnectionStore {
    rows: Arc<RwLock<HashMap<(String, String), ClientConnection>>>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn put(&self, conn: ClientConnection) -> Result<()> {
        let key = (conn.obj_id.clone(), conn.client_id.clone());
        self.rows.write().await.insert(key, conn);
        Ok(())
    }

    async fn get(&self, obj_id: &str, client_id: &str) -> Result<Option<ClientConnection>> {
        let key = (obj_id.to_string(), client_id.to_string());
        Ok(self.rows.read().await.get(&key).cloned())
    }

    async fn list_for_object(&self, obj_id: &str) -> Result<Vec<ClientConnection>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|conn| conn.obj_id == obj_id)
            .cloned()
            .collect())
    }

    async fn find_by_socket(&self, socket_id: &str) -> Result<Vec<ClientConnection>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|conn| conn.socket_id == socket_id)
            .cloned()
            .collect())
    }

    async fn remove(&self, obj_id: &str, client_id: &str) -> Result<()> {
        let key = (obj_id.to_string(), client_id.to_string());
        self.rows.write().await.remove(&key);
        Ok(())
    }

    async fn remove_socket(&self, socket_id: &str) -> Result<Vec<ClientConnection>> {
        let mut rows = self.rows.write().await;
        let keys: Vec<_> = rows
            .iter()
            .filter(|(_, conn)| conn.socket_id == socket_id)
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(conn) = rows.remove(&key) {
                removed.push(conn);
            }
        }
        Ok(removed)
    }

    async fn touch_ping(&self, socket_id: &str, at: i64) -> Result<()> {
        let mut rows = self.rows.write().await;
        for conn in rows.values_mut() {
            if conn.socket_id == socket_id {
                conn.last_ping_at = at;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_then_exists() {
        let store = MemoryStateStore::new();
        let outcome = store
            .create(SyncedObject::new("doc1", json!({})))
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Created));

        let outcome = store
            .create(SyncedObject::new("doc1", json!({"other": 1})))
            .await
            .unwrap();
        match outcome {
            CreateOutcome::Exists(existing) => assert_eq!(existing.state, json!({})),
            CreateOutcome::Created => panic!("second create must not win"),
        }
    }

    #[tokio::test]
    async fn test_cas_exactly_one_winner() {
        let store = MemoryStateStore::new();
        store
            .create(SyncedObject::new("doc1", json!({})))
            .await
            .unwrap();

        let mut first = store.get("doc1").await.unwrap().unwrap();
        first.revision = 1;
        first.state = json!({"x": 1});
        let mut second = store.get("doc1").await.unwrap().unwrap();
        second.revision = 1;
        second.state = json!({"y": 2});

        assert!(matches!(
            store.compare_and_swap(0, first).await.unwrap(),
            CasOutcome::Committed
        ));
        match store.compare_and_swap(0, second).await.unwrap() {
            CasOutcome::Conflict(current) => {
                assert_eq!(current.revision, 1);
                assert_eq!(current.state, json!({"x": 1}));
            }
            CasOutcome::Committed => panic!("stale write must not commit"),
        }
    }

    #[tokio::test]
    async fn test_cas_missing_object() {
        let store = MemoryStateStore::new();
        let err = store
            .compare_and_swap(0, SyncedObject::new("ghost", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_connection_upsert_replaces_socket() {
        let store = MemoryConnectionStore::new();
        store
            .put(ClientConnection::new("doc1", "a", "sock-1", None))
            .await
            .unwrap();
        store
            .put(ClientConnection::new("doc1", "a", "sock-2", None))
            .await
            .unwrap();

        let rows = store.list_for_object("doc1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].socket_id, "sock-2");
        assert!(store.find_by_socket("sock-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_socket_returns_rows() {
        let store = MemoryConnectionStore::new();
        store
            .put(ClientConnection::new("doc1", "a", "sock-1", None))
            .await
            .unwrap();
        store
            .put(ClientConnection::new("doc2", "a", "sock-1", None))
            .await
            .unwrap();
        store
            .put(ClientConnection::new("doc1", "b", "sock-2", None))
            .await
            .unwrap();

        let removed = store.remove_socket("sock-1").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.list_for_object("doc1").await.unwrap().len(), 1);
    }
}
