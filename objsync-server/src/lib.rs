//! ObjSync Server Library
//!
//! The authoritative serialization point for synced objects: applies client
//! commands under a per-object compare-and-swap gate, fans results out to
//! every registered connection, and manages the connection registry across
//! socket lifecycle events. Stateless per invocation; all coordination
//! state lives in the stores.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod socket;

pub use config::ServerConfig;
pub use dispatch::{
    AcceptAllConnections, CommandSender, ConnectionAccept, ConnectionRequest,
    ConnectionTransformer, DefaultStateProvider, DispatchService, EmptyDefaultState, NewObject,
};
pub use error::DispatchError;
pub use socket::{SocketRegistry, SyncServer};
