//! Persistence adapters for collaborative documents.
//!
//! Architecture:
//! ```text
//!                    DocAdapter
//!        ┌───────────┬────┴─────┬────────────┬─────────────┐
//!        ▼           ▼          ▼            ▼             ▼
//! ┌────────────┐ ┌────────┐ ┌────────┐ ┌────────────┐ ┌────────────┐
//! │ Memory     │ │ Kv     │ │ Log    │ │ Rocks      │ │ Sqlite     │
//! │ chunk log  │ │ record │ │ append │ │ content    │ │ content    │
//! │ + fan-out  │ │ per    │ │ only   │ │ addressed  │ │ addressed  │
//! │            │ │ guid   │ │ file   │ │ guid#uuid  │ │ (guid,hash)│
//! └────────────┘ └────────┘ └────────┘ └────────────┘ └────────────┘
//! ```
//!
//! The first three keep a [`ChunkLog`] per guid and merge it once it grows
//! past the compaction threshold. The last two store each update under a
//! content address so redelivery is idempotent.

pub mod chunk;
pub mod kv;
pub mod locks;
pub mod log;
pub mod memory;
pub mod rocks;
pub mod sqlite;

pub use chunk::{ChunkConfig, ChunkLog, ChunkStats, UpdateRecord, DEFAULT_COMPACTION_THRESHOLD};
pub use kv::{KvConfig, KvStorage, WorkspaceRecord};
pub use locks::GuidLocks;
pub use self::log::{LogConfig, LogStorage};
pub use memory::MemoryStorage;
pub use rocks::{RocksStorage, StoreConfig};
pub use sqlite::{InsertOutcome, SqliteStorage};

use uuid::Uuid;

use crate::error::SyncResult;
use crate::update;

/// Namespace for content-address uuids.
pub const UPDATE_NAMESPACE: Uuid = Uuid::from_u128(0x9f70269f_a4d2_4fa6_b8b3_fb296ffc0649);

/// Content address of `update` within its guid: a v5 uuid of
/// `"{clock}-{client}"` of the leading struct, or of the raw bytes when the
/// update carries no structs.
pub fn content_hash(update: &[u8]) -> SyncResult<Uuid> {
    Ok(match update::leading_struct_id(update)? {
        Some((client, clock)) => {
            Uuid::new_v5(&UPDATE_NAMESPACE, format!("{clock}-{client}").as_bytes())
        }
        None => Uuid::new_v5(&UPDATE_NAMESPACE, update),
    })
}
