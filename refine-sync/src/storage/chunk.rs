//! Per-guid update log with threshold compaction.
//!
//! A [`ChunkLog`] is the unit every storage backend persists: an ordered
//! list of `{update, timestamp}` records whose merge is the document state.
//! Once the list grows past the threshold, the next append first collapses
//! all records into a single merged one. Merging is lossless, so a query
//! after compaction returns the same state as replaying every record.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::adapter::DocState;
use crate::error::SyncResult;
use crate::update;

/// Default number of records a log may hold before compacting.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 200;

/// One stored update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// v1-encoded yrs update
    pub update: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl UpdateRecord {
    pub fn new(update: Vec<u8>) -> Self {
        Self {
            update,
            timestamp: now_millis(),
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Record count above which the next append compacts first
    pub compaction_threshold: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChunkStats {
    pub record_count: usize,
    pub total_bytes: usize,
    pub compactions: u64,
}

/// Result of [`ChunkLog::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Existing records were merged into one before the append.
    CompactedThenAppended,
}

#[derive(Debug, Clone)]
pub struct ChunkLog {
    records: Vec<UpdateRecord>,
    threshold: usize,
    compactions: u64,
}

impl ChunkLog {
    pub fn new(config: &ChunkConfig) -> Self {
        Self::from_records(Vec::new(), config)
    }

    /// Rebuild a log from persisted records (oldest first).
    pub fn from_records(records: Vec<UpdateRecord>, config: &ChunkConfig) -> Self {
        Self {
            records,
            threshold: config.compaction_threshold,
            compactions: 0,
        }
    }

    /// Whether the next append will compact.
    pub fn needs_compaction(&self) -> bool {
        self.records.len() > self.threshold
    }

    /// Validate and append one update, compacting first when over threshold.
    pub fn append(&mut self, update: &[u8]) -> SyncResult<AppendOutcome> {
        update::validate(update)?;
        let outcome = if self.needs_compaction() {
            self.compact()?;
            AppendOutcome::CompactedThenAppended
        } else {
            AppendOutcome::Appended
        };
        self.records.push(UpdateRecord::new(update.to_vec()));
        Ok(outcome)
    }

    /// Collapse all records into one merged record.
    pub fn compact(&mut self) -> SyncResult<()> {
        if self.records.len() < 2 {
            return Ok(());
        }
        let before = self.records.len();
        let merged = update::merge_updates(&self.update_slices())?;
        self.records = vec![UpdateRecord::new(merged)];
        self.compactions += 1;
        log::debug!("Compacted {before} update records into one");
        Ok(())
    }

    /// Merge of every record, or `None` if the log is empty.
    pub fn merged(&self) -> SyncResult<Option<Vec<u8>>> {
        if self.records.is_empty() {
            return Ok(None);
        }
        update::merge_updates(&self.update_slices()).map(Some)
    }

    pub fn query(&self, state_vector: Option<&[u8]>) -> SyncResult<DocState> {
        doc_state_from_updates(&self.update_slices(), state_vector)
    }

    pub fn records(&self) -> &[UpdateRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> ChunkStats {
        ChunkStats {
            record_count: self.records.len(),
            total_bytes: self.records.iter().map(|r| r.update.len()).sum(),
            compactions: self.compactions,
        }
    }

    fn update_slices(&self) -> Vec<&[u8]> {
        self.records.iter().map(|r| r.update.as_slice()).collect()
    }
}

/// Build a [`DocState`] reply from stored updates.
///
/// With nothing stored the reply is the canonical empty update and no
/// state vector.
pub fn doc_state_from_updates<T: AsRef<[u8]>>(
    updates: &[T],
    state_vector: Option<&[u8]>,
) -> SyncResult<DocState> {
    if updates.is_empty() {
        return Ok(DocState::empty());
    }
    let merged = update::merge_updates(updates)?;
    let missing_update = match state_vector {
        Some(sv) => update::diff_update(&merged, sv)?,
        None => merged.clone(),
    };
    Ok(DocState {
        missing_update,
        state_vector: Some(update::state_vector_from_update(&merged)?),
    })
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

    fn content_of(update: &[u8]) -> String {
        let doc = Doc::new();
        crate::checker::apply(&doc, update, "test").unwrap();
        let mut txn = doc.transact_mut();
        txn.get_or_insert_text("content").get_string(&txn)
    }

    #[test]
    fn test_empty_log_query() {
        let log = ChunkLog::new(&ChunkConfig::default());
        let state = log.query(None).unwrap();
        assert_eq!(state, DocState::empty());
        assert!(log.merged().unwrap().is_none());
    }

    #[test]
    fn test_append_rejects_malformed() {
        let mut log = ChunkLog::new(&ChunkConfig::default());
        assert!(log.append(&[0xff, 0xff, 0xff]).is_err());
        assert!(log.is_empty());
    }

    #[test]
    fn test_compaction_threshold() {
        let config = ChunkConfig { compaction_threshold: 3 };
        let mut log = ChunkLog::new(&config);
        let doc = Doc::new();

        for i in 0..4 {
            let outcome = log.append(&append_text(&doc, &i.to_string())).unwrap();
            assert_eq!(outcome, AppendOutcome::Appended);
        }
        assert_eq!(log.len(), 4);

        // Over threshold: collapse four records, then append the fifth
        let outcome = log.append(&append_text(&doc, "4")).unwrap();
        assert_eq!(outcome, AppendOutcome::CompactedThenAppended);
        assert_eq!(log.len(), 2);
        assert_eq!(log.stats().compactions, 1);

        assert_eq!(content_of(&log.merged().unwrap().unwrap()), "01234");
    }

    #[test]
    fn test_query_with_state_vector() {
        let mut log = ChunkLog::new(&ChunkConfig::default());
        let doc = Doc::new();
        log.append(&append_text(&doc, "abc")).unwrap();

        let sv = crate::update::encode_state_vector(&doc);
        let state = log.query(Some(&sv)).unwrap();
        assert!(crate::update::is_empty(&state.missing_update));
        assert!(state.state_vector.is_some());

        let full = log.query(None).unwrap();
        assert_eq!(content_of(&full.missing_update), "abc");
    }
}
