//! # scribe-collab: Central-authority document synchronization
//!
//! One [`Manager`] per process owns named document instances. Clients submit
//! steps against the version they last saw; the manager rebases them over
//! whatever was applied in between, or rejects them with a typed error code.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  CollabTransport   ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │  Manager    │
//! │ (per doc)   │  Local | WebSocket │ (authority) │
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │
//!        ▼                                  ├── Instance (doc, version, step log)
//! ┌─────────────┐                           ├── RoomManager (version bumps)
//! │ SyncContext │                           └── Disk (debounced writes)
//! │ view+pending│                                  │
//! └─────────────┘                           DiskBackend: memory | RocksDB (LZ4)
//! ```
//!
//! ## Modules
//!
//! - [`error`]: error codes (400/404/409/410/500) and [`CollabError`]
//! - [`protocol`]: request/response shapes and the JSON envelope
//! - [`instance`]: authoritative doc, version and bounded step log
//! - [`manager`]: instance registry and the request surface
//! - [`disk`]: debounced persistence with pending-write tracking
//! - [`broadcast`]: version-bump fan-out per document
//! - [`transport`]: in-process and WebSocket transports
//! - [`server`]: WebSocket front end for a manager
//! - [`client`]: client sync state machine

pub mod error;
pub mod protocol;
pub mod instance;
pub mod manager;
pub mod disk;
pub mod broadcast;
pub mod transport;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use error::{CollabError, ErrorCode};
pub use protocol::{
    parse_collab_response, ClientFrame, CollabReply, CollabRequest, CollabResponse, ErrorBody,
    GetDocumentRequest, GetDocumentResponse, ProtocolError, PullEventsRequest, PullEventsResponse,
    PushEventsRequest, PushEventsResponse, ServerFrame, StepRecord, VersionBump,
};
pub use instance::{ClientPresence, Instance};
pub use manager::{Manager, ManagerConfig, ManagerStats};
pub use disk::{
    backend::{DiskBackend, MemoryBackend},
    rocks::{DocumentMetadata, RocksBackend, RocksConfig},
    Disk, DiskConfig, DiskError, DiskRecord, DiskStats, PendingWrites,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use transport::{CollabTransport, LocalTransport, WsTransport, WsTransportConfig};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use client::{
    ClientConfig, ClientError, ClientState, ErrorState, SyncClient, SyncEvent, SyncHandle,
    SyncSnapshot,
};
