//! In-memory adapter with live fan-out.
//!
//! Every subscriber sees every accepted update, including the sender's own;
//! providers drop their own echoes by origin.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::adapter::{AdapterSubscription, DocAdapter, DocState, UpdateCallback, UpdateListeners};
use crate::error::SyncResult;
use crate::storage::chunk::{ChunkConfig, ChunkLog, ChunkStats};

#[derive(Default)]
pub struct MemoryStorage {
    logs: RwLock<HashMap<String, Arc<Mutex<ChunkLog>>>>,
    config: ChunkConfig,
    listeners: UpdateListeners,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_config(ChunkConfig::default())
    }

    pub fn with_config(config: ChunkConfig) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            config,
            listeners: UpdateListeners::new(),
        }
    }

    fn log_for(&self, guid: &str) -> Arc<Mutex<ChunkLog>> {
        if let Some(log) = self.logs.read().get(guid) {
            return log.clone();
        }
        self.logs
            .write()
            .entry(guid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ChunkLog::new(&self.config))))
            .clone()
    }

    pub fn guids(&self) -> Vec<String> {
        self.logs.read().keys().cloned().collect()
    }

    pub fn stats(&self, guid: &str) -> Option<ChunkStats> {
        self.logs.read().get(guid).map(|log| log.lock().stats())
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

#[async_trait]
impl DocAdapter for MemoryStorage {
    async fn query_doc_state(&self, guid: &str, state_vector: Option<&[u8]>) -> SyncResult<DocState> {
        let log = match self.logs.read().get(guid) {
            Some(log) => log.clone(),
            None => return Ok(DocState::empty()),
        };
        let state = log.lock().query(state_vector);
        state
    }

    async fn send_doc_update(&self, guid: &str, update: &[u8], origin: &str) -> SyncResult<()> {
        self.log_for(guid).lock().append(update)?;
        log::trace!("memory store accepted {} bytes for {guid} from {origin}", update.len());
        self.listeners.emit(guid, update);
        Ok(())
    }

    fn on_doc_update(&self, callback: UpdateCallback) -> Option<AdapterSubscription> {
        Some(self.listeners.subscribe(callback))
    }
}
