//! Append-only, log-structured adapter.
//!
//! Layout: one file per guid under the store directory, named by the hex
//! encoding of the guid. Each file is a sequence of frames:
//!
//! ```text
//! ┌───────────┬──────────────────────────────────────────────┐
//! │ len: u32  │ bincode(LogEntry { seq, kind, origin,        │
//! │ (LE)      │                    record, checksum })       │
//! └───────────┴──────────────────────────────────────────────┘
//! ```
//!
//! `Append` frames add a record; a `Compact` frame replaces everything
//! before it. Compaction rewrites the file through a temporary and an
//! atomic rename, so a crash leaves either the old or the new log.
//!
//! Replay stops at the first torn or corrupt frame and keeps the valid
//! prefix; the file is rewritten so later appends stay readable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::adapter::{DocAdapter, DocState};
use crate::error::{SyncError, SyncResult};
use crate::storage::chunk::{AppendOutcome, ChunkConfig, ChunkLog, UpdateRecord};
use crate::storage::locks::GuidLocks;

const LOG_EXTENSION: &str = "log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    Append = 1,
    /// Replaces all earlier records
    Compact = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub kind: EntryKind,
    pub origin: String,
    pub record: UpdateRecord,
    pub checksum: u32,
}

impl LogEntry {
    pub fn new(sequence: u64, kind: EntryKind, origin: &str, record: UpdateRecord) -> Self {
        let checksum = Self::compute_checksum(sequence, kind, origin, &record);
        Self {
            sequence,
            kind,
            origin: origin.to_string(),
            record,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, self.kind, &self.origin, &self.record)
    }

    /// FNV-1a over every field.
    fn compute_checksum(sequence: u64, kind: EntryKind, origin: &str, record: &UpdateRecord) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        let mut mix = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= u32::from(*byte);
                hash = hash.wrapping_mul(0x0100_0193);
            }
        };
        mix(&sequence.to_le_bytes());
        mix(&[kind as u8]);
        mix(origin.as_bytes());
        mix(&record.timestamp.to_le_bytes());
        mix(&record.update);
        hash
    }

    /// Length-prefixed frame.
    pub fn encode_frame(&self) -> SyncResult<Vec<u8>> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::StorageIo(format!("encode log entry: {e}")))?;
        let len = u32::try_from(body.len())
            .map_err(|_| SyncError::StorageIo("log entry exceeds 4GiB".into()))?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// Parse every valid frame; returns the entries and whether the tail was bad.
pub fn decode_frames(bytes: &[u8]) -> (Vec<LogEntry>, bool) {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let Some(header) = bytes.get(pos..pos + 4) else {
            return (entries, true);
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let Some(body) = bytes.get(pos + 4..pos + 4 + len) else {
            return (entries, true);
        };
        let decoded: Result<(LogEntry, usize), _> =
            bincode::serde::decode_from_slice(body, bincode::config::standard());
        match decoded {
            Ok((entry, _)) if entry.verify() => entries.push(entry),
            _ => return (entries, true),
        }
        pos += 4 + len;
    }
    (entries, false)
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub chunk: ChunkConfig,
    /// fsync after every append
    pub sync_writes: bool,
}

impl LogConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            chunk: ChunkConfig::default(),
            sync_writes: false,
        }
    }
}

struct GuidLog {
    chunks: ChunkLog,
    next_sequence: u64,
}

impl GuidLog {
    /// Every record as fresh frames, the first one compacting.
    fn snapshot_frames(&mut self) -> SyncResult<Vec<u8>> {
        let mut bytes = Vec::new();
        for (i, record) in self.chunks.records().iter().enumerate() {
            let kind = if i == 0 { EntryKind::Compact } else { EntryKind::Append };
            let entry = LogEntry::new(self.next_sequence, kind, "compaction", record.clone());
            self.next_sequence += 1;
            bytes.extend_from_slice(&entry.encode_frame()?);
        }
        Ok(bytes)
    }
}

/// One replayed log, shared between the cache and the call using it.
type SharedLog = Arc<Mutex<GuidLog>>;

pub struct LogStorage {
    config: LogConfig,
    locks: GuidLocks,
    loaded: Mutex<HashMap<String, SharedLog>>,
}

impl LogStorage {
    pub async fn open(config: LogConfig) -> SyncResult<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;
        log::info!("Opened log store at {}", config.dir.display());
        Ok(Self {
            config,
            locks: GuidLocks::new(),
            loaded: Mutex::new(HashMap::new()),
        })
    }

    /// Guids that have a log file on disk.
    pub async fn guids(&self) -> SyncResult<Vec<String>> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            if let Some(guid) = path.file_stem().and_then(|s| s.to_str()).and_then(hex_decode) {
                out.push(guid);
            }
        }
        out.sort();
        Ok(out)
    }

    /// All records currently stored for `guid`, oldest first.
    pub async fn get(&self, guid: &str) -> SyncResult<Vec<UpdateRecord>> {
        let _guard = self.locks.lock(guid).await;
        let state = self.load(guid).await?;
        let records = state.lock().chunks.records().to_vec();
        Ok(records)
    }

    /// Number of guids whose log is held in memory.
    pub fn cached_len(&self) -> usize {
        self.loaded.lock().len()
    }

    fn path_for(&self, guid: &str) -> PathBuf {
        self.config.dir.join(format!("{}.{LOG_EXTENSION}", hex_encode(guid)))
    }

    /// Cached state, or a replay of the file. Caller holds the guid lock.
    async fn load(&self, guid: &str) -> SyncResult<SharedLog> {
        if let Some(state) = self.loaded.lock().get(guid) {
            return Ok(state.clone());
        }
        let path = self.path_for(guid);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (entries, corrupt_tail) = decode_frames(&bytes);
        let mut records = Vec::new();
        let mut next_sequence = 0;
        for entry in entries {
            next_sequence = entry.sequence + 1;
            if entry.kind == EntryKind::Compact {
                records.clear();
            }
            records.push(entry.record);
        }
        let chunks = ChunkLog::from_records(records, &self.config.chunk);
        let kept = chunks.len();
        let state = Arc::new(Mutex::new(GuidLog {
            chunks,
            next_sequence,
        }));

        if corrupt_tail {
            log::warn!("Log for {guid} has a corrupt tail; keeping {kept} valid records");
            self.rewrite(guid, &state).await?;
        }
        self.loaded.lock().insert(guid.to_string(), state.clone());
        Ok(state)
    }

    async fn append_frame(&self, path: &Path, frame: &[u8]) -> SyncResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(frame).await?;
        if self.config.sync_writes {
            file.sync_data().await?;
        }
        Ok(())
    }

    /// Write the whole log as fresh frames and swap it into place.
    async fn rewrite(&self, guid: &str, state: &SharedLog) -> SyncResult<()> {
        let bytes = state.lock().snapshot_frames()?;
        let path = self.path_for(guid);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn append(&self, guid: &str, state: &SharedLog, update: &[u8], origin: &str) -> SyncResult<()> {
        let frame = {
            let mut guid_log = state.lock();
            match guid_log.chunks.append(update)? {
                AppendOutcome::Appended => {
                    let record = guid_log
                        .chunks
                        .records()
                        .last()
                        .cloned()
                        .ok_or_else(|| SyncError::StorageIo("append produced no record".into()))?;
                    let entry =
                        LogEntry::new(guid_log.next_sequence, EntryKind::Append, origin, record);
                    guid_log.next_sequence += 1;
                    Some(entry.encode_frame()?)
                }
                AppendOutcome::CompactedThenAppended => None,
            }
        };
        match frame {
            Some(frame) => self.append_frame(&self.path_for(guid), &frame).await,
            None => {
                log::debug!("Rewriting compacted log for {guid}");
                self.rewrite(guid, state).await
            }
        }
    }
}

#[async_trait]
impl DocAdapter for LogStorage {
    async fn query_doc_state(&self, guid: &str, state_vector: Option<&[u8]>) -> SyncResult<DocState> {
        let _guard = self.locks.lock(guid).await;
        let state = self.load(guid).await?;
        let result = state.lock().chunks.query(state_vector);
        result
    }

    async fn send_doc_update(&self, guid: &str, update: &[u8], origin: &str) -> SyncResult<()> {
        let _guard = self.locks.lock(guid).await;
        let state = self.load(guid).await?;
        let result = self.append(guid, &state, update, origin).await;
        if result.is_err() {
            // Memory may be ahead of the file; replay on next use
            self.loaded.lock().remove(guid);
        }
        result
    }
}

fn hex_encode(s: &str) -> String {
    s.bytes().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<String> {
    if s.len() % 2 != 0 {
        return None;
    }
    let bytes: Option<Vec<u8>> = (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect();
    String::from_utf8(bytes?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact, WriteTxn};

    fn append_text(doc: &Doc, s: &str) -> Vec<u8> {
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, s);
        }
        doc.transact().encode_state_as_update_v1(&before)
    }

    #[test]
    fn test_entry_checksum_detects_tamper() {
        let mut entry = LogEntry::new(7, EntryKind::Append, "peer", UpdateRecord::new(vec![0, 0]));
        assert!(entry.verify());
        entry.record.update = vec![1, 0];
        assert!(!entry.verify());
    }

    #[test]
    fn test_decode_frames_stops_at_torn_tail() {
        let a = LogEntry::new(0, EntryKind::Append, "p", UpdateRecord::new(vec![0, 0]));
        let b = LogEntry::new(1, EntryKind::Append, "p", UpdateRecord::new(vec![0, 0]));
        let mut bytes = a.encode_frame().unwrap();
        let frame_b = b.encode_frame().unwrap();
        bytes.extend_from_slice(&frame_b[..frame_b.len() - 2]);

        let (entries, corrupt) = decode_frames(&bytes);
        assert_eq!(entries.len(), 1);
        assert!(corrupt);
    }

    #[test]
    fn test_hex_roundtrip() {
        let guid = "workspace/page:1";
        assert_eq!(hex_decode(&hex_encode(guid)).as_deref(), Some(guid));
        assert!(hex_decode("abc").is_none());
    }

    #[tokio::test]
    async fn test_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Doc::new();
        {
            let store = LogStorage::open(LogConfig::new(dir.path())).await.unwrap();
            store.send_doc_update("root", &append_text(&doc, "x"), "a").await.unwrap();
            store.send_doc_update("root", &append_text(&doc, "y"), "b").await.unwrap();
        }

        let store = LogStorage::open(LogConfig::new(dir.path())).await.unwrap();
        assert_eq!(store.guids().await.unwrap(), vec!["root".to_string()]);
        assert_eq!(store.get("root").await.unwrap().len(), 2);

        let state = store.query_doc_state("root", None).await.unwrap();
        let replica = Doc::new();
        crate::checker::apply(&replica, &state.missing_update, "test").unwrap();
        let mut txn = replica.transact_mut();
        assert_eq!(txn.get_or_insert_text("content").get_string(&txn), "xy");
    }

    #[tokio::test]
    async fn test_corrupt_tail_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Doc::new();
        {
            let store = LogStorage::open(LogConfig::new(dir.path())).await.unwrap();
            store.send_doc_update("root", &append_text(&doc, "x"), "a").await.unwrap();
        }
        // Simulate a torn write
        let path = dir.path().join(format!("{}.log", hex_encode("root")));
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[9, 0, 0, 0, 1, 2]);
        std::fs::write(&path, &bytes).unwrap();

        let store = LogStorage::open(LogConfig::new(dir.path())).await.unwrap();
        assert_eq!(store.get("root").await.unwrap().len(), 1);
        store.send_doc_update("root", &append_text(&doc, "y"), "a").await.unwrap();

        let reopened = LogStorage::open(LogConfig::new(dir.path())).await.unwrap();
        assert_eq!(reopened.get("root").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_compaction_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LogConfig::new(dir.path());
        config.chunk.compaction_threshold = 2;
        let doc = Doc::new();
        {
            let store = LogStorage::open(config.clone()).await.unwrap();
            for s in ["a", "b", "c", "d"] {
                store.send_doc_update("root", &append_text(&doc, s), "a").await.unwrap();
            }
        }
        let store = LogStorage::open(config).await.unwrap();
        assert_eq!(store.get("root").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cached_log_is_shared_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStorage::open(LogConfig::new(dir.path())).await.unwrap();
        let doc = Doc::new();
        store.send_doc_update("root", &append_text(&doc, "a"), "p").await.unwrap();

        let first = store.load("root").await.unwrap();
        let second = store.load("root").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.cached_len(), 1);

        // Appends land in the cached log instead of a copy of it
        store.send_doc_update("root", &append_text(&doc, "b"), "p").await.unwrap();
        assert_eq!(first.lock().chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_append_drops_cached_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStorage::open(LogConfig::new(dir.path())).await.unwrap();
        let doc = Doc::new();
        store.send_doc_update("root", &append_text(&doc, "a"), "p").await.unwrap();

        assert!(store.send_doc_update("root", &[0xff, 0xff, 0xff], "p").await.is_err());
        assert_eq!(store.cached_len(), 0);
        assert_eq!(store.get("root").await.unwrap().len(), 1);
    }
}
