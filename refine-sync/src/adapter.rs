//! The storage/transport contract the provider synchronizes against.
//!
//! A [`DocAdapter`] knows nothing about live documents, only about update
//! bytes keyed by guid. Disk backends, the in-memory store and the relay
//! client all implement it, so a provider can be pointed at any of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SyncResult;

/// Reply to [`DocAdapter::query_doc_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocState {
    /// Everything the caller's state vector lacks (or the full state).
    pub missing_update: Vec<u8>,
    /// The adapter's own state vector, when it holds any state.
    pub state_vector: Option<Vec<u8>>,
}

impl DocState {
    pub fn empty() -> Self {
        Self {
            missing_update: crate::update::EMPTY_UPDATE.to_vec(),
            state_vector: None,
        }
    }
}

/// Push callback: `(guid, update)`.
pub type UpdateCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[async_trait]
pub trait DocAdapter: Send + Sync {
    /// Merged state for `guid`, reduced to what `state_vector` is missing.
    async fn query_doc_state(&self, guid: &str, state_vector: Option<&[u8]>) -> SyncResult<DocState>;

    /// Persist or forward one update for `guid`.
    async fn send_doc_update(&self, guid: &str, update: &[u8], origin: &str) -> SyncResult<()>;

    /// Live notification of updates that arrive from elsewhere.
    ///
    /// Backends without fan-out return `None`.
    fn on_doc_update(&self, _callback: UpdateCallback) -> Option<AdapterSubscription> {
        None
    }
}

/// Disposer returned by [`DocAdapter::on_doc_update`]. Dropping it
/// unsubscribes.
pub struct AdapterSubscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl AdapterSubscription {
    pub fn new(dispose: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }
}

impl Drop for AdapterSubscription {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

/// Callback set shared by adapters that support live fan-out.
#[derive(Default)]
pub struct UpdateListeners {
    next_id: AtomicU64,
    callbacks: Arc<Mutex<HashMap<u64, UpdateCallback>>>,
}

impl UpdateListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: UpdateCallback) -> AdapterSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(id, callback);
        let weak: Weak<Mutex<HashMap<u64, UpdateCallback>>> = Arc::downgrade(&self.callbacks);
        AdapterSubscription::new(move || {
            if let Some(callbacks) = weak.upgrade() {
                callbacks.lock().remove(&id);
            }
        })
    }

    /// Invoke every callback. Callbacks run outside the lock.
    pub fn emit(&self, guid: &str, update: &[u8]) -> usize {
        let callbacks: Vec<UpdateCallback> = self.callbacks.lock().values().cloned().collect();
        for cb in &callbacks {
            cb(guid, update);
        }
        callbacks.len()
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
