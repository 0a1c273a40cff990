//! Shared error taxonomy for the sync engine.
//!
//! Transport- and revision-level failures are recoverable and handled in
//! place (reconnect, resync, prune); only rejected connections and
//! persistence faults surface to callers. Revision conflicts travel on the
//! wire as `Command::Conflict` rather than as an error value.

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The transport handshake failed. Recoverable: the engine retries with
/// backoff unless the client was disposed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("transport handshake failed: {0}")]
    Handshake(String),

    #[error("client disposed")]
    Disposed,
}

/// Delivery to one recipient failed. Recoverable by pruning that
/// connection; invisible to the remaining recipients.
#[derive(Debug, thiserror::Error)]
#[error("delivery to socket {socket_id} failed: {reason}")]
pub struct DeliveryFailure {
    pub socket_id: String,
    pub reason: String,
}

/// The connection transformer declined the connection. Terminal for the
/// attempt: surfaced explicitly, never retried automatically.
#[derive(Debug, Clone, thiserror::Error)]
#[error("connection rejected: {reason}")]
pub struct ConnectionRejected {
    pub reason: String,
}
