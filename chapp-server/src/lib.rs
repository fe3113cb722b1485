//! # chapp-server: Real-time chat message fan-out
//!
//! Persists chat messages in a key-value backend and pushes every change to
//! all connected WebSocket clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ ChatClient  │ ◄─────────────────► │ ChatServer  │
//! │ (per user)  │     JSON frames     │ (sessions)  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!        HTTP handlers ─────────────► │ ChatService │
//!                                     └──┬───────┬──┘
//!                                        │       │
//!                              ┌─────────┴──┐ ┌──┴──────────┐
//!                              │MessageStore│ │ Broadcaster │
//!                              └─────┬──────┘ └──┬──────────┘
//!                                    │           │
//!                              ┌─────┴──────┐ ┌──┴─────────────────┐
//!                              │ KvBackend  │ │ ConnectionRegistry │
//!                              │ mem/rocks  │ │ (fan-out targets)  │
//!                              └────────────┘ └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope `{msgType, payload}` and message types
//! - [`storage`]: `KvBackend` trait with in-memory and RocksDB backends
//! - [`store`]: Message records plus the recency index
//! - [`registry`]: Live connections and their outbound buffers
//! - [`broadcast`]: Fan-out of one event to every connection
//! - [`service`]: Create/list/edit/delete with broadcast on success
//! - [`server`]: WebSocket accept loop and per-connection sessions
//! - [`client`]: WebSocket client with an offline outbox

pub mod protocol;
pub mod storage;
pub mod store;
pub mod registry;
pub mod broadcast;
pub mod service;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientRequest, DeleteNotice, DeleteRequest, EditNotice, EditRequest, Message, MessageKind,
    ProtocolError, ServerEvent,
};
pub use storage::{BackendError, KvBackend, MemoryBackend, RocksBackend, RocksConfig};
pub use store::{MessageStore, StoreConfig, StoreError};
pub use registry::{
    ChannelError, Connection, ConnectionId, ConnectionRegistry, Frame, PrunedConnection, Registration,
};
pub use broadcast::{BroadcastReport, BroadcastStats, Broadcaster};
pub use service::ChatService;
pub use server::{ChatServer, ServerConfig, ServerError, ServerStats, SessionState};
pub use client::{ChatClient, ChatEvent, ConnectionState, Outbox};
