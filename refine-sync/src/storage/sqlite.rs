//! SQLite-backed, content-addressed update store.
//!
//! Same addressing as [`RocksStorage`](super::RocksStorage): each row is keyed
//! by `(guid, hash)` so a resent update never produces a second row. Calls
//! into SQLite block, so adapter methods hop onto the blocking pool.
//!
//! Each call takes its own connection from a small pool and the database
//! runs in WAL mode, so readers never wait on a writer and a slow guid holds
//! no process-wide lock. The read-modify-write in [`SqliteStorage::insert`]
//! is serialized per guid by [`GuidLocks`] on the async path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::adapter::{DocAdapter, DocState};
use crate::error::{SyncError, SyncResult};
use crate::storage::chunk::{doc_state_from_updates, now_millis};
use crate::storage::content_hash;
use crate::storage::locks::GuidLocks;
use crate::update;

/// Idle connections kept for reuse.
const MAX_IDLE_CONNECTIONS: usize = 8;
/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a single insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Identical bytes already stored under the same hash
    Duplicate,
    /// Different bytes under the same hash; the row now holds their merge
    Merged,
}

struct ConnectionPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    /// Holds the directory of a scratch database until the pool drops.
    _scratch: Option<tempfile::TempDir>,
}

impl ConnectionPool {
    fn open(&self) -> SyncResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        log::trace!("sqlite connection opened ({mode})");
        Ok(conn)
    }

    /// Run `f` on a pooled connection, opening one if none is idle.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> SyncResult<T>) -> SyncResult<T> {
        let idle = self.idle.lock().pop();
        let mut conn = match idle {
            Some(conn) => conn,
            None => self.open()?,
        };
        let result = f(&mut conn);
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
        result
    }
}

#[derive(Clone)]
pub struct SqliteStorage {
    pool: Arc<ConnectionPool>,
    locks: Arc<GuidLocks>,
}

impl SqliteStorage {
    /// Open or create a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        Self::init(path.as_ref().to_path_buf(), None)
    }

    /// Scratch database in a temporary directory. Data is lost when the
    /// last clone is dropped.
    pub fn in_memory() -> SyncResult<Self> {
        let dir = tempfile::tempdir()?;
        Self::init(dir.path().join("updates.db"), Some(dir))
    }

    fn init(path: PathBuf, scratch: Option<tempfile::TempDir>) -> SyncResult<Self> {
        let pool = ConnectionPool {
            path,
            idle: Mutex::new(Vec::new()),
            _scratch: scratch,
        };
        pool.with_conn(|conn| {
            conn.execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guid TEXT NOT NULL,
                hash TEXT NOT NULL,
                data BLOB NOT NULL,
                origin TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                UNIQUE(guid, hash)
            );

            CREATE INDEX IF NOT EXISTS idx_updates_guid ON updates(guid, id);
            "#,
            )?;
            Ok(())
        })?;
        Ok(Self {
            pool: Arc::new(pool),
            locks: Arc::new(GuidLocks::new()),
        })
    }

    /// Stored updates for `guid` in insertion order.
    pub fn get(&self, guid: &str) -> SyncResult<Vec<Vec<u8>>> {
        self.pool.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT data FROM updates WHERE guid = ? ORDER BY id ASC")?;
            let rows = stmt
                .query_map(params![guid], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Callers on the async path hold the guid's lock around this.
    pub fn insert(&self, guid: &str, data: &[u8], origin: &str) -> SyncResult<InsertOutcome> {
        update::validate(data)?;
        let hash = content_hash(data)?.hyphenated().to_string();

        self.pool.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing: Option<Vec<u8>> = tx
                .query_row(
                    "SELECT data FROM updates WHERE guid = ? AND hash = ?",
                    params![guid, hash],
                    |row| row.get(0),
                )
                .optional()?;

            let outcome = match existing {
                Some(stored) if stored.as_slice() == data => InsertOutcome::Duplicate,
                Some(stored) => {
                    let merged = update::merge_updates(&[stored.as_slice(), data])?;
                    tx.execute(
                        "UPDATE updates SET data = ?, timestamp = ? WHERE guid = ? AND hash = ?",
                        params![merged, now_millis() as i64, guid, hash],
                    )?;
                    InsertOutcome::Merged
                }
                None => {
                    tx.execute(
                        "INSERT OR IGNORE INTO updates (guid, hash, data, origin, timestamp)
                         VALUES (?, ?, ?, ?, ?)",
                        params![guid, hash, data, origin, now_millis() as i64],
                    )?;
                    InsertOutcome::Inserted
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
    }

    pub fn record_count(&self, guid: &str) -> SyncResult<usize> {
        let count: i64 = self.pool.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM updates WHERE guid = ?",
                params![guid],
                |row| row.get(0),
            )?)
        })?;
        Ok(count as usize)
    }

    pub fn guids(&self) -> SyncResult<Vec<String>> {
        self.pool.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT guid FROM updates ORDER BY guid")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

async fn blocking<T, F>(f: F) -> SyncResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> SyncResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::StorageIo(format!("sqlite task failed: {e}")))?
}

#[async_trait]
impl DocAdapter for SqliteStorage {
    async fn query_doc_state(&self, guid: &str, state_vector: Option<&[u8]>) -> SyncResult<DocState> {
        let store = self.clone();
        let key = guid.to_string();
        let updates = blocking(move || store.get(&key)).await?;
        doc_state_from_updates(&updates, state_vector)
    }

    async fn send_doc_update(&self, guid: &str, update: &[u8], origin: &str) -> SyncResult<()> {
        let _guard = self.locks.lock(guid).await;
        let store = self.clone();
        let (guid, data, origin) = (guid.to_string(), update.to_vec(), origin.to_string());
        let outcome = blocking(move || store.insert(&guid, &data, &origin)).await?;
        log::trace!("sqlite insert: {outcome:?}");
        Ok(())
    }
}
