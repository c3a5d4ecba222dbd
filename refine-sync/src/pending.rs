//! Updates waiting for their document.
//!
//! Two queues per guid:
//! - `pending`: updates that arrived before the document was set up.
//!   Drained once, in arrival order, when the document appears.
//! - `deferred`: updates that arrived for a live document but had a causal
//!   gap. Retried after every successful apply to the same guid.
//!
//! A guid that is never set up would grow `pending` without bound, so each
//! queue is folded into one merged update when it fills, and the oldest guid
//! is dropped once too many are waiting.

use std::collections::{HashMap, VecDeque};

use crate::update;

/// Queued updates per guid before they are merged into one.
pub const MAX_PENDING_PER_GUID: usize = 256;
/// Guids with pending updates before the oldest is dropped.
pub const MAX_PENDING_GUIDS: usize = 1024;

#[derive(Debug)]
pub struct PendingCache {
    pending: HashMap<String, Vec<Vec<u8>>>,
    /// Guids in the order their first pending update arrived
    arrival: VecDeque<String>,
    deferred: HashMap<String, Vec<Vec<u8>>>,
    max_per_guid: usize,
    max_guids: usize,
}

impl Default for PendingCache {
    fn default() -> Self {
        Self::with_limits(MAX_PENDING_PER_GUID, MAX_PENDING_GUIDS)
    }
}

impl PendingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_per_guid: usize, max_guids: usize) -> Self {
        Self {
            pending: HashMap::new(),
            arrival: VecDeque::new(),
            deferred: HashMap::new(),
            max_per_guid: max_per_guid.max(1),
            max_guids: max_guids.max(1),
        }
    }

    pub fn push(&mut self, guid: &str, update: Vec<u8>) {
        if !self.pending.contains_key(guid) {
            while self.pending.len() >= self.max_guids {
                let Some(oldest) = self.arrival.pop_front() else {
                    break;
                };
                if let Some(dropped) = self.pending.remove(&oldest) {
                    log::warn!(
                        "Dropping {} pending updates for {oldest}: too many documents waiting",
                        dropped.len()
                    );
                }
            }
            self.arrival.push_back(guid.to_string());
        }

        let max_per_guid = self.max_per_guid;
        let queue = self.pending.entry(guid.to_string()).or_default();
        queue.push(update);
        if queue.len() > max_per_guid {
            match update::merge_updates(queue.as_slice()) {
                Ok(merged) => {
                    log::debug!("Folded {} pending updates for {guid}", queue.len());
                    *queue = vec![merged];
                }
                Err(e) => {
                    log::warn!("Dropping oldest pending update for {guid}: {e}");
                    queue.remove(0);
                }
            }
        }
    }

    /// Remove and return every pending update for `guid`, oldest first.
    pub fn take(&mut self, guid: &str) -> Vec<Vec<u8>> {
        self.forget_arrival(guid);
        self.pending.remove(guid).unwrap_or_default()
    }

    fn forget_arrival(&mut self, guid: &str) {
        if let Some(pos) = self.arrival.iter().position(|g| g == guid) {
            self.arrival.remove(pos);
        }
    }

    pub fn defer(&mut self, guid: &str, update: Vec<u8>) {
        let queue = self.deferred.entry(guid.to_string()).or_default();
        if !queue.contains(&update) {
            queue.push(update);
        }
    }

    pub fn take_deferred(&mut self, guid: &str) -> Vec<Vec<u8>> {
        self.deferred.remove(guid).unwrap_or_default()
    }

    pub fn has_deferred(&self, guid: &str) -> bool {
        self.deferred.get(guid).is_some_and(|q| !q.is_empty())
    }

    /// Drop both queues for a document that went away.
    pub fn remove(&mut self, guid: &str) {
        self.forget_arrival(guid);
        self.pending.remove(guid);
        self.deferred.remove(guid);
    }

    pub fn pending_len(&self, guid: &str) -> usize {
        self.pending.get(guid).map_or(0, Vec::len)
    }

    pub fn deferred_len(&self, guid: &str) -> usize {
        self.deferred.get(guid).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.deferred.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.arrival.clear();
        self.deferred.clear();
    }
}
