//! ObjSync Client Library
//!
//! Transport-agnostic sync engine for one client's subscription to one
//! synced object, plus the two transport adapters:
//! - WebSocket (goes through the server dispatch service and its
//!   compare-and-swap gate)
//! - Local broadcast (same-device peer-to-peer channel for multi-tab
//!   consistency; no conflict step)

pub mod engine;
pub mod transport;

pub use engine::{ClientError, ClientEvent, ConnectionState, SyncClient, SyncClientOptions};
pub use transport::broadcast::{BroadcastHub, LocalBroadcastTransport};
pub use transport::socket::WebSocketTransport;
pub use transport::{Transport, TransportError, TransportEvent};
