//! ObjSync Core Library
//!
//! Core functionality for ObjSync including:
//! - Wire command types (client and remote command variants)
//! - Opaque op model applied to JSON object state
//! - Synced object and client connection records
//! - Persistence abstraction (state store + connection registry)
//! - In-memory stores for tests and single-process setups
//! - Persistent store using Fjall LSM-tree

pub mod command;
pub mod error;
pub mod memory;
pub mod object;
pub mod op;
pub mod persistent;
pub mod store;

pub use command::{decode_batch, encode_batch, ClientCommand, Command, RemoteCommand, PROTOCOL_VERSION};
pub use error::{ConnectError, ConnectionRejected, DeliveryFailure, StoreError};
pub use memory::{MemoryConnectionStore, MemoryStateStore};
pub use object::{ClientConnection, LoggedOp, SyncedObject};
pub use op::{Op, OpError, PathSeg};
pub use persistent::PersistentStore;
pub use store::{CasOutcome, ConnectionStore, CreateOutcome, Result, StateStore};
