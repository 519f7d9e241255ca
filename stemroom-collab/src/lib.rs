//! # stemroom-collab — realtime track rooms
//!
//! WebSocket rooms that keep every collaborator's copy of a track in sync.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ws://…/{track}?token=…   ┌──────────────┐
//! │ SyncClient  │ ◄────────────────────────► │ SyncServer   │
//! │ (per user)  │      bincode SyncMessage   │ (central)    │
//! └──────┬──────┘                            └──────┬───────┘
//!        │                                          │ Connection FSM
//!        ▼                                          ▼
//! ┌─────────────┐                            ┌──────────────┐
//! │ replica     │                            │ TrackRoom    │──► DocumentStore
//! │ (local)     │                            │ (authority)  │
//! └─────────────┘                            └──────┬───────┘
//!                                                   │
//!                                           ┌───────┴───────┐
//!                                           │ BroadcastGroup│
//!                                           │ + Awareness   │
//!                                           └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`gateway`] — per-connection admission state machine
//! - [`room`] — per-track authoritative replica, serialized mutations
//! - [`broadcast`] — room fan-out with lag detection
//! - [`presence`] — ephemeral awareness channel
//! - [`storage`] — RocksDB persistence of room documents
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client

pub mod broadcast;
pub mod client;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use gateway::{CloseReason, Connection, AUTH_FAILED_CLOSE_CODE, AUTH_FAILED_REASON};
pub use presence::{Awareness, AwarenessMessage, PresenceEntry, PresenceView};
pub use protocol::{ErrorPayload, MessageType, ProtocolError, SyncMessage, SERVER_SENDER};
pub use room::{JoinHandshake, RoomManager, TrackRoom};
pub use server::{ObjectStorageConfig, ServerConfig, ServerStats, SyncServer};
pub use storage::{DocumentStore, StoreConfig, StoreError, TrackMetadata};
