//! RocksDB-backed, content-addressed update store for servers.
//!
//! Column families:
//! - `updates`: one value per stored update, keyed `guid#<uuid>`
//!
//! The uuid is a v5 uuid of `"{clock}-{client}"` taken from the update's
//! leading struct, so re-sending an update that is already stored lands on
//! the same key instead of duplicating it. Updates without structs (pure
//! deletions) are addressed by their bytes.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::PathBuf;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use uuid::Uuid;

use crate::adapter::{DocAdapter, DocState};
use crate::error::{SyncError, SyncResult};
use crate::storage::chunk::doc_state_from_updates;
use crate::storage::content_hash;
use crate::storage::locks::GuidLocks;
use crate::update;

const CF_UPDATES: &str = "updates";

const KEY_SEPARATOR: char = '#';
const UUID_MIN: &str = "00000000-0000-0000-0000-000000000000";
const UUID_MAX: &str = "ffffffff-ffff-ffff-ffff-ffffffffffff";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("refine_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub fn encode_key(guid: &str, hash: &str) -> String {
    format!("{guid}{KEY_SEPARATOR}{hash}")
}

pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    locks: GuidLocks,
}

impl RocksStorage {
    pub fn open(config: StoreConfig) -> SyncResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        cf_opts.set_block_based_table_factory(&block_opts);
        cf_opts.set_compression_type(DBCompressionType::Lz4);
        cf_opts.set_write_buffer_size(config.write_buffer_size);
        // Many small writes, range-scanned per guid
        cf_opts.set_max_write_buffer_number(4);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_UPDATES, cf_opts)],
        )?;
        log::info!("Opened update store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            locks: GuidLocks::new(),
        })
    }

    /// Every stored update for `guid`, in key order.
    pub fn get(&self, guid: &str) -> SyncResult<Vec<Vec<u8>>> {
        Ok(self.scan(guid)?.into_iter().map(|(_, v)| v).collect())
    }

    /// Store one update under its content address. Returns `false` when the
    /// identical update was already present.
    pub fn put(&self, guid: &str, update: &[u8]) -> SyncResult<bool> {
        update::validate(update)?;
        let cf = self.cf()?;
        let key = encode_key(guid, &content_hash(update)?.hyphenated().to_string());

        let value = match self.db.get_cf(&cf, key.as_bytes())? {
            Some(existing) if existing.as_slice() == update => return Ok(false),
            // Same leading struct, different content: keep both halves
            Some(existing) => update::merge_updates(&[existing.as_slice(), update])?,
            None => update.to_vec(),
        };

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, key.as_bytes(), value, &write_opts)?;
        Ok(true)
    }

    /// Number of update records stored for `guid`.
    pub fn record_count(&self, guid: &str) -> SyncResult<usize> {
        Ok(self.scan(guid)?.len())
    }

    fn scan(&self, guid: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let cf = self.cf()?;
        let start = encode_key(guid, UUID_MIN);
        let end = encode_key(guid, UUID_MAX);
        let prefix = format!("{guid}{KEY_SEPARATOR}");

        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(start.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if &key[..] > end.as_bytes() {
                break;
            }
            let key = String::from_utf8_lossy(&key).into_owned();
            // Skip nested guids such as `guid#x#...` that sort inside the range
            match key.strip_prefix(&prefix) {
                Some(hash) if Uuid::parse_str(hash).is_ok() && hash.len() == UUID_MIN.len() => {
                    out.push((key, value.to_vec()));
                }
                _ => continue,
            }
        }
        Ok(out)
    }

    fn cf(&self) -> SyncResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_UPDATES)
            .ok_or_else(|| SyncError::StorageIo(format!("column family {CF_UPDATES} missing")))
    }
}

#[async_trait]
impl DocAdapter for RocksStorage {
    async fn query_doc_state(&self, guid: &str, state_vector: Option<&[u8]>) -> SyncResult<DocState> {
        doc_state_from_updates(&self.get(guid)?, state_vector)
    }

    async fn send_doc_update(&self, guid: &str, update: &[u8], origin: &str) -> SyncResult<()> {
        let _guard = self.locks.lock(guid).await;
        if !self.put(guid, update)? {
            log::debug!("Duplicate update for {guid} from {origin} ignored");
        }
        Ok(())
    }
}
