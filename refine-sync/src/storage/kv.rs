//! Embedded key-value adapter: one record per guid.
//!
//! Mirrors the shape of a browser object store: the whole chunk log of a
//! document lives in a single `WorkspaceRecord` value, read, modified and
//! written back on every update. Records are bincode-encoded and LZ4
//! compressed in a dedicated RocksDB column family.

use std::path::PathBuf;

use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, Options, SingleThreaded, WriteOptions};
use serde::{Deserialize, Serialize};

use crate::adapter::{DocAdapter, DocState};
use crate::error::{SyncError, SyncResult};
use crate::storage::chunk::{ChunkConfig, ChunkLog, UpdateRecord};
use crate::storage::locks::GuidLocks;

const CF_WORKSPACE: &str = "workspace";

/// Stored value for one guid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub guid: String,
    pub updates: Vec<UpdateRecord>,
    /// Name of the store that wrote the record
    pub author: String,
}

impl WorkspaceRecord {
    fn encode(&self) -> SyncResult<Vec<u8>> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::StorageIo(format!("encode record: {e}")))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> SyncResult<Self> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| SyncError::StorageIo(format!("decompress record: {e}")))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| SyncError::StorageIo(format!("decode record: {e}")))?;
        Ok(record)
    }
}

#[derive(Debug, Clone)]
pub struct KvConfig {
    pub path: PathBuf,
    /// Written into each record's `author` field
    pub name: String,
    pub chunk: ChunkConfig,
    /// fsync on every write
    pub sync_writes: bool,
}

impl KvConfig {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            chunk: ChunkConfig::default(),
            sync_writes: false,
        }
    }
}

pub struct KvStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: KvConfig,
    locks: GuidLocks,
}

impl KvStorage {
    pub fn open(config: KvConfig) -> SyncResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let mut cf_opts = Options::default();
        // Values are already LZ4 framed
        cf_opts.set_compression_type(rocksdb::DBCompressionType::None);
        let descriptors = vec![ColumnFamilyDescriptor::new(CF_WORKSPACE, cf_opts)];

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;
        log::info!("Opened key-value store '{}' at {}", config.name, config.path.display());
        Ok(Self {
            db,
            config,
            locks: GuidLocks::new(),
        })
    }

    /// Read the record for `guid`, if any.
    pub fn get(&self, guid: &str) -> SyncResult<Option<WorkspaceRecord>> {
        let cf = self.cf()?;
        match self.db.get_cf(&cf, guid.as_bytes())? {
            Some(bytes) => WorkspaceRecord::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put(&self, record: &WorkspaceRecord) -> SyncResult<()> {
        let cf = self.cf()?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, record.guid.as_bytes(), record.encode()?, &write_opts)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn cf(&self) -> SyncResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_WORKSPACE)
            .ok_or_else(|| SyncError::StorageIo(format!("column family {CF_WORKSPACE} missing")))
    }
}

#[async_trait]
impl DocAdapter for KvStorage {
    async fn query_doc_state(&self, guid: &str, state_vector: Option<&[u8]>) -> SyncResult<DocState> {
        match self.get(guid)? {
            Some(record) => {
                ChunkLog::from_records(record.updates, &self.config.chunk).query(state_vector)
            }
            None => Ok(DocState::empty()),
        }
    }

    async fn send_doc_update(&self, guid: &str, update: &[u8], _origin: &str) -> SyncResult<()> {
        let _guard = self.locks.lock(guid).await;
        let existing = self.get(guid)?.map(|r| r.updates).unwrap_or_default();
        let mut log = ChunkLog::from_records(existing, &self.config.chunk);
        log.append(update)?;
        self.put(&WorkspaceRecord {
            guid: guid.to_string(),
            updates: log.records().to_vec(),
            author: self.config.name.clone(),
        })
    }
}
