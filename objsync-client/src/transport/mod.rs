//! Transport seam between the sync engine and a concrete channel.
//!
//! A transport owns the channel lifecycle and surfaces inbound traffic as a
//! stream of command batches; the engine never touches sockets directly.

pub mod broadcast;
pub mod socket;

use async_trait::async_trait;
use objsync_core::{Command, ConnectError};
use tokio::sync::mpsc;

/// Inbound transport traffic.
#[derive(Debug)]
pub enum TransportEvent {
    /// One decoded wire frame.
    Batch(Vec<Command>),
    /// The channel closed (remote close, read error, or local teardown).
    Closed,
}

/// Errors that can occur while sending on an established channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    Send(String),
}

/// The three primitives the engine needs from a channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the channel and return its inbound event stream. Calling
    /// this again replaces any previous channel (reconnect).
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, ConnectError>;

    /// Send one batch of commands.
    async fn send(&self, commands: &[Command]) -> Result<(), TransportError>;

    /// Tear down the current channel. Idempotent.
    async fn close(&self);
}
