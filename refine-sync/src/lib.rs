//! # refine-sync: CRDT document sync engine
//!
//! Keeps a tree of yrs documents (a root plus lazily discovered
//! sub-documents) in step with a storage or network backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  query / send / push  ┌──────────────────────────┐
//! │ LazyProvider │ ◄───────────────────► │ dyn DocAdapter           │
//! │ (per root)   │                       │  memory | kv | log       │
//! └──────┬───────┘                       │  rocks  | sqlite         │
//!        │                               │  RelayClient ──┐         │
//!        ▼                               └────────────────┼─────────┘
//! ┌──────────────┐                                        │ WebSocket
//! │ CausalChecker│                                        ▼ binary frames
//! │ PendingCache │                               ┌──────────────────┐
//! │ DocRegistry  │                               │ RelayServer      │
//! └──────────────┘                               │  RelayState      │
//!                                                │  BroadcastGroup  │
//!                                                └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`update`]: Update codec helpers over the yrs v1 encoding
//! - [`checker`]: Causal gap detection before apply
//! - [`status`]: Idle / Syncing / Synced / Error tracking
//! - [`pending`]: Updates held for unknown or gapped documents
//! - [`registry`]: Live documents by guid
//! - [`adapter`]: The backend contract
//! - [`storage`]: Persistence adapters
//! - [`protocol`]: Binary wire protocol (bincode-encoded WireMessage)
//! - [`broadcast`]: Fan-out with backpressure
//! - [`relay`]: WebSocket relay server
//! - [`client`]: WebSocket relay client with offline queue
//! - [`provider`]: The lazy sync provider

pub mod adapter;
pub mod broadcast;
pub mod checker;
pub mod client;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod status;
pub mod storage;
pub mod update;

// Re-exports for convenience
pub use adapter::{AdapterSubscription, DocAdapter, DocState, UpdateCallback};
pub use checker::{CausalChecker, Reconciled};
pub use client::{ClientConfig, ConnectionState, RelayClient};
pub use error::{SyncError, SyncResult};
pub use protocol::{MessageType, WireMessage};
pub use provider::{DocLifecycle, LazyProvider, ProviderOptions};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use status::Status;
pub use storage::{KvStorage, LogStorage, MemoryStorage, RocksStorage, SqliteStorage};
