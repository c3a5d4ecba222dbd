//! Sync status with an in-flight operation counter.
//!
//! Every query or send brackets itself with [`StatusTracker::begin`] and
//! [`StatusTracker::finish`]. The counter decides between `Syncing` and a
//! settled state; an error wins over both and stays until an operation that
//! started after it succeeds, or the provider reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Idle,
    Syncing,
    Synced,
    /// Carries the display form of the failing operation's error.
    Error(String),
}

impl Status {
    pub fn is_error(&self) -> bool {
        matches!(self, Status::Error(_))
    }
}

pub type StatusCallback = Arc<dyn Fn(&Status) + Send + Sync>;

type CallbackMap = Mutex<HashMap<u64, StatusCallback>>;

/// Handle for one in-flight operation.
#[derive(Debug)]
#[must_use = "an operation must be finished to release its slot"]
pub struct OpTicket {
    seq: u64,
}

/// Unregisters its callback when dropped.
pub struct StatusSubscription {
    id: u64,
    callbacks: Weak<CallbackMap>,
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.lock().remove(&self.id);
        }
    }
}

struct TrackerState {
    depth: usize,
    connected: bool,
    /// Error cause plus the first operation sequence allowed to clear it.
    error: Option<(String, u64)>,
    next_seq: u64,
    current: Status,
}

impl TrackerState {
    fn evaluate(&self) -> Status {
        if let Some((cause, _)) = &self.error {
            Status::Error(cause.clone())
        } else if self.depth > 0 {
            Status::Syncing
        } else if self.connected {
            Status::Synced
        } else {
            Status::Idle
        }
    }
}

pub struct StatusTracker {
    state: Mutex<TrackerState>,
    callbacks: Arc<CallbackMap>,
    next_callback_id: AtomicU64,
    watch_tx: watch::Sender<Status>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(Status::Idle);
        Self {
            state: Mutex::new(TrackerState {
                depth: 0,
                connected: false,
                error: None,
                next_seq: 0,
                current: Status::Idle,
            }),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            next_callback_id: AtomicU64::new(0),
            watch_tx,
        }
    }

    pub fn status(&self) -> Status {
        self.state.lock().current.clone()
    }

    /// Number of operations currently in flight.
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    pub fn begin(&self) -> OpTicket {
        let (ticket, status) = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.depth += 1;
            state.current = state.evaluate();
            (OpTicket { seq }, state.current.clone())
        };
        self.notify(&status);
        ticket
    }

    pub fn finish(&self, ticket: OpTicket, outcome: Result<(), &SyncError>) {
        let status = {
            let mut state = self.state.lock();
            match state.depth.checked_sub(1) {
                Some(depth) => state.depth = depth,
                None => log::error!("status depth underflow (op #{})", ticket.seq),
            }
            match outcome {
                Err(e) => {
                    let clear_from = state.next_seq;
                    state.error = Some((e.to_string(), clear_from));
                }
                Ok(()) => {
                    if matches!(state.error, Some((_, clear_from)) if ticket.seq >= clear_from) {
                        state.error = None;
                    }
                }
            }
            state.current = state.evaluate();
            state.current.clone()
        };
        self.notify(&status);
    }

    /// Record the provider's connection flag. Connecting clears a sticky error.
    pub fn set_connected(&self, connected: bool) {
        let changed = {
            let mut state = self.state.lock();
            state.connected = connected;
            if connected {
                state.error = None;
            }
            let next = state.evaluate();
            if next == state.current {
                None
            } else {
                state.current = next.clone();
                Some(next)
            }
        };
        if let Some(status) = changed {
            self.notify(&status);
        }
    }

    pub fn on_change(&self, callback: impl Fn(&Status) + Send + Sync + 'static) -> StatusSubscription {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(id, Arc::new(callback));
        StatusSubscription {
            id,
            callbacks: Arc::downgrade(&self.callbacks),
        }
    }

    pub fn watch(&self) -> watch::Receiver<Status> {
        self.watch_tx.subscribe()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    fn notify(&self, status: &Status) {
        self.watch_tx.send_replace(status.clone());
        // Callbacks run outside the lock so they may query the tracker.
        let callbacks: Vec<StatusCallback> = self.callbacks.lock().values().cloned().collect();
        for cb in callbacks {
            cb(status);
        }
    }
}
