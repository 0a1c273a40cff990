//! Persistence abstraction for object state and the connection registry.
//!
//! The object store's conditional write is the only locking primitive the
//! system needs: every write to an object goes through the same
//! compare-and-swap gate, so writes are serialized per object no matter how
//! many dispatch instances run concurrently.

use crate::error::StoreError;
use crate::object::{ClientConnection, SyncedObject};
use async_trait::async_trait;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a conditional object write.
#[derive(Debug)]
pub enum CasOutcome {
    /// The stored revision matched and the update was committed.
    Committed,
    /// Another writer won; carries the current record.
    Conflict(SyncedObject),
}

/// Outcome of an insert-if-absent.
#[derive(Debug)]
pub enum CreateOutcome {
    Created,
    /// The object already existed; carries the current record.
    Exists(SyncedObject),
}

/// Authoritative object-state store keyed by `obj_id`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Point-read one object.
    async fn get(&self, obj_id: &str) -> Result<Option<SyncedObject>>;

    /// Insert a fresh object, failing softly when one already exists.
    /// This is the revision-0 gate that makes concurrent first connections
    /// converge on one record.
    async fn create(&self, obj: SyncedObject) -> Result<CreateOutcome>;

    /// Write `updated` only if the stored revision still equals
    /// `expected_revision`. Returns `NotFound` when the object is missing.
    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        updated: SyncedObject,
    ) -> Result<CasOutcome>;

    /// Remove one object. Removing an absent object is a no-op.
    async fn delete(&self, obj_id: &str) -> Result<()>;
}

/// Connection registry keyed by `(obj_id, client_id)` with a secondary
/// lookup by `socket_id`.
///
/// The registry is not contended for correctness of object state: stale
/// rows only degrade fan-out until they are pruned.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Upsert one connection. A `(obj_id, client_id)` pair maps to at most
    /// one live socket, so a reconnect replaces the previous row.
    async fn put(&self, conn: ClientConnection) -> Result<()>;

    /// Point-read one connection.
    async fn get(&self, obj_id: &str, client_id: &str) -> Result<Option<ClientConnection>>;

    /// Every connection registered for an object (fan-out set).
    async fn list_for_object(&self, obj_id: &str) -> Result<Vec<ClientConnection>>;

    /// Every connection riding a transport socket.
    async fn find_by_socket(&self, socket_id: &str) -> Result<Vec<ClientConnection>>;

    /// Remove one connection. Removing an absent row is a no-op.
    async fn remove(&self, obj_id: &str, client_id: &str) -> Result<()>;

    /// Remove every connection riding a socket, returning the removed rows.
    async fn remove_socket(&self, socket_id: &str) -> Result<Vec<ClientConnection>>;

    /// Refresh `last_ping_at` for every connection riding a socket.
    async fn touch_ping(&self, socket_id: &str, at: i64) -> Result<()>;
}
