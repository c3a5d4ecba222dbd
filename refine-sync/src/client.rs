//! WebSocket client for the relay, exposed as a [`DocAdapter`].
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - `query_doc_state` as a pull: `Diff` without payload, then `Ping`
//! - Update forwarding, and push of every relayed `Update` to listeners
//! - Offline queue for updates sent while disconnected
//!
//! The relay answers frames of one connection in order, so the `Pong` for a
//! query's `Ping` arrives after the state reply its `Diff` produced. Waiters
//! are kept in a FIFO and resolved one per `Pong`; a waiter whose caller
//! gave up stays queued so later `Pong`s still line up.
//!
//! Reference: Kleppmann, Chapter 5, Replication

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::adapter::{AdapterSubscription, DocAdapter, DocState, UpdateCallback, UpdateListeners};
use crate::error::{SyncError, SyncResult};
use crate::protocol::WireMessage;
use crate::storage::chunk::doc_state_from_updates;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9091`
    pub url: String,
    /// How long a query or ping waits for its `Pong`
    pub request_timeout: Duration,
    /// Updates held while offline; further sends fail
    pub offline_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9091".to_string(),
            request_timeout: Duration::from_secs(10),
            offline_queue_capacity: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Offline queue for updates made while disconnected.
///
/// Queued updates are replayed in order on reconnection.
/// Target: 1000 queued ops replay in <50ms.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    guid: String,
    update: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, guid: &str, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate {
            guid: guid.to_string(),
            update,
            queued_at: Instant::now(),
        });
        true
    }

    /// Drain all queued updates in arrival order.
    pub fn drain(&mut self) -> Vec<(String, Vec<u8>)> {
        self.queue.drain(..).map(|q| (q.guid, q.update)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|q| q.update.len()).sum()
    }

    /// Age of the oldest queued update.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|q| q.queued_at.elapsed())
    }
}

/// A request waiting for its `Pong`.
enum Waiter {
    Query {
        guid: String,
        collected: Vec<Vec<u8>>,
        tx: oneshot::Sender<Vec<Vec<u8>>>,
    },
    Ping {
        tx: oneshot::Sender<()>,
    },
}

struct ConnState {
    connection: ConnectionState,
    /// Frames for the writer task; `None` while disconnected
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    waiters: VecDeque<Waiter>,
    offline: OfflineQueue,
    /// Bumped on every connect and disconnect; stale reader tasks compare it
    epoch: u64,
}

struct ClientShared {
    state: Mutex<ConnState>,
    listeners: UpdateListeners,
}

impl ClientShared {
    fn dispatch(&self, msg: WireMessage) {
        match msg {
            // Live edits always go to listeners, which check them before apply
            WireMessage::Update { guid, update } => {
                self.listeners.emit(&guid, &update);
            }
            WireMessage::Diff {
                guid,
                payload: Some(state),
            } => {
                let mut st = self.state.lock();
                // Timed-out queries stay queued for their Pong but take nothing
                let claimed = st.waiters.iter_mut().find_map(|w| match w {
                    Waiter::Query {
                        guid: g,
                        collected,
                        tx,
                    } if *g == guid && !tx.is_closed() => Some(collected),
                    _ => None,
                });
                match claimed {
                    Some(collected) => collected.push(state),
                    None => log::debug!("No pending query for state of {guid}"),
                }
            }
            WireMessage::Pong => {
                let waiter = self.state.lock().waiters.pop_front();
                match waiter {
                    Some(Waiter::Query { collected, tx, .. }) => {
                        let _ = tx.send(collected);
                    }
                    Some(Waiter::Ping { tx }) => {
                        let _ = tx.send(());
                    }
                    None => log::debug!("Unsolicited pong"),
                }
            }
            WireMessage::Ping => {
                let st = self.state.lock();
                if let (Some(out), Ok(frame)) = (st.outgoing.as_ref(), WireMessage::Pong.encode()) {
                    let _ = out.send(frame);
                }
            }
            WireMessage::Diff { guid, payload: None } => {
                log::debug!("Ignoring pull for {guid} sent to client");
            }
        }
    }

    fn connection_lost(&self, epoch: u64) {
        let mut st = self.state.lock();
        if st.epoch != epoch {
            return;
        }
        st.connection = ConnectionState::Disconnected;
        st.outgoing = None;
        // Dropping the senders fails every in-flight request
        st.waiters.clear();
        log::info!("Relay connection lost");
    }
}

/// Relay client.
pub struct RelayClient {
    config: ClientConfig,
    shared: Arc<ClientShared>,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        let offline = OfflineQueue::new(config.offline_queue_capacity);
        Self {
            config,
            shared: Arc::new(ClientShared {
                state: Mutex::new(ConnState {
                    connection: ConnectionState::Disconnected,
                    outgoing: None,
                    waiters: VecDeque::new(),
                    offline,
                    epoch: 0,
                }),
                listeners: UpdateListeners::new(),
            }),
        }
    }

    /// Connect to the relay and replay the offline queue.
    ///
    /// Spawns background tasks for reading and writing frames.
    pub async fn connect(&self) -> SyncResult<()> {
        {
            let mut st = self.shared.state.lock();
            if st.connection != ConnectionState::Disconnected {
                return Ok(());
            }
            st.connection = ConnectionState::Connecting;
        }

        let ws_stream = match tokio_tungstenite::connect_async(&self.config.url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.shared.state.lock().connection = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let epoch = {
            let mut st = self.shared.state.lock();
            st.epoch += 1;
            st.connection = ConnectionState::Connected;

            let queued = st.offline.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued updates", queued.len());
            }
            for (guid, update) in queued {
                if let Ok(frame) = WireMessage::update(guid, update).encode() {
                    let _ = out_tx.send(frame);
                }
            }
            st.outgoing = Some(out_tx);
            st.epoch
        };
        log::info!("Connected to relay at {}", self.config.url);

        // Reader task: process incoming frames
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match WireMessage::decode(&bytes) {
                            Ok(msg) => shared.dispatch(msg),
                            Err(e) => log::warn!("Failed to decode relay frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            shared.connection_lost(epoch);
        });

        Ok(())
    }

    /// Close the connection. In-flight requests fail with
    /// [`SyncError::ConnectionClosed`]; later sends are queued.
    pub fn disconnect(&self) {
        let mut st = self.shared.state.lock();
        st.epoch += 1;
        st.connection = ConnectionState::Disconnected;
        st.outgoing = None;
        st.waiters.clear();
    }

    /// Round-trip time to the relay.
    pub async fn ping(&self) -> SyncResult<Duration> {
        let (tx, rx) = oneshot::channel();
        let started = Instant::now();
        {
            let mut st = self.shared.state.lock();
            let out = st.outgoing.clone().ok_or(SyncError::ConnectionClosed)?;
            out.send(WireMessage::Ping.encode()?)
                .map_err(|_| SyncError::ConnectionClosed)?;
            st.waiters.push_back(Waiter::Ping { tx });
        }
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(SyncError::ConnectionClosed),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.lock().connection
    }

    pub fn offline_queue_len(&self) -> usize {
        self.shared.state.lock().offline.len()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl DocAdapter for RelayClient {
    async fn query_doc_state(&self, guid: &str, state_vector: Option<&[u8]>) -> SyncResult<DocState> {
        let diff = WireMessage::diff(guid, None).encode()?;
        let ping = WireMessage::Ping.encode()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.shared.state.lock();
            let out = st.outgoing.clone().ok_or(SyncError::ConnectionClosed)?;
            // Registered under the same lock as the send so waiters stay in Pong order
            out.send(diff).map_err(|_| SyncError::ConnectionClosed)?;
            out.send(ping).map_err(|_| SyncError::ConnectionClosed)?;
            st.waiters.push_back(Waiter::Query {
                guid: guid.to_string(),
                collected: Vec::new(),
                tx,
            });
        }

        let collected = match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(collected)) => collected,
            Ok(Err(_)) => return Err(SyncError::ConnectionClosed),
            Err(_) => return Err(SyncError::Timeout),
        };
        doc_state_from_updates(&collected, state_vector)
    }

    async fn send_doc_update(&self, guid: &str, update: &[u8], origin: &str) -> SyncResult<()> {
        let frame = WireMessage::update(guid, update.to_vec()).encode()?;
        let mut st = self.shared.state.lock();
        let sent = match st.outgoing.as_ref() {
            Some(out) => out.send(frame).is_ok(),
            None => false,
        };
        if sent {
            log::trace!("Sent {} bytes for {guid} ({origin})", update.len());
            return Ok(());
        }
        if st.offline.enqueue(guid, update.to_vec()) {
            log::debug!("Offline: queued update for {guid}");
            Ok(())
        } else {
            Err(SyncError::ConnectionClosed)
        }
    }

    fn on_doc_update(&self, callback: UpdateCallback) -> Option<AdapterSubscription> {
        Some(self.shared.listeners.subscribe(callback))
    }
}
