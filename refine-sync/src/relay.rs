//! Transport relay: one merged update per guid, fanned out over WebSockets.
//!
//! Architecture:
//! ```text
//! Provider A ──┐                       ┌── RelayState (guid → merged update)
//!              ├── RelayServer ────────┤
//! Provider B ──┘   (task per conn)     ├── BroadcastGroup ──► every conn but sender
//!                                      │
//!                                      └── DocAdapter backend (optional)
//!                                              lazy load, persist on accept
//! ```
//!
//! The relay never materializes documents. It validates, merges and forwards
//! update bytes, so it has no notion of sub-documents either: every guid is
//! an independent entry.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::adapter::DocAdapter;
use crate::broadcast::{BroadcastGroup, PeerInfo};
use crate::error::{SyncError, SyncResult};
use crate::protocol::WireMessage;
use crate::update;

/// Origin recorded when the relay persists into its backend.
pub const RELAY_ORIGIN: &str = "relay";

/// What to do after a `Diff` request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiffOutcome {
    /// Sent back to the requesting connection as a `Diff` with payload
    pub reply: Option<Vec<u8>>,
    /// Sent to every other connection as an `Update`
    pub broadcast: Option<Vec<u8>>,
}

/// Merged update per guid.
#[derive(Debug, Default)]
pub struct RelayState {
    docs: HashMap<String, Vec<u8>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull and push.
    ///
    /// Without payload, replies with the stored update. With a valid
    /// payload, merges it in; if state already existed the merged bytes go
    /// both back to the requester and out to everyone else. Malformed
    /// payloads produce nothing.
    pub fn handle_diff(&mut self, guid: &str, payload: Option<&[u8]>) -> DiffOutcome {
        let Some(payload) = payload else {
            return DiffOutcome {
                reply: self.docs.get(guid).cloned(),
                broadcast: None,
            };
        };
        if let Err(e) = update::validate(payload) {
            log::warn!("Dropping malformed diff payload for {guid}: {e}");
            return DiffOutcome::default();
        }

        match self.docs.get(guid) {
            None => {
                self.docs.insert(guid.to_string(), payload.to_vec());
                DiffOutcome {
                    reply: None,
                    broadcast: Some(payload.to_vec()),
                }
            }
            Some(existing) => match update::merge_updates(&[existing.as_slice(), payload]) {
                Ok(merged) => {
                    self.docs.insert(guid.to_string(), merged.clone());
                    DiffOutcome {
                        reply: Some(merged.clone()),
                        broadcast: Some(merged),
                    }
                }
                Err(e) => {
                    log::warn!("Merge failed for {guid}, keeping stored state: {e}");
                    DiffOutcome {
                        reply: Some(existing.clone()),
                        broadcast: None,
                    }
                }
            },
        }
    }

    /// Merge one update into `guid`. The first write initializes the entry.
    pub fn handle_update(&mut self, guid: &str, incoming: &[u8]) -> SyncResult<()> {
        update::validate(incoming)?;
        let merged = match self.docs.get(guid) {
            Some(existing) => update::merge_updates(&[existing.as_slice(), incoming])?,
            None => incoming.to_vec(),
        };
        self.docs.insert(guid.to_string(), merged);
        Ok(())
    }

    pub fn get(&self, guid: &str) -> Option<&[u8]> {
        self.docs.get(guid).map(Vec::as_slice)
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.docs.contains_key(guid)
    }

    pub fn guids(&self) -> Vec<String> {
        self.docs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before a slow peer starts lagging
    pub broadcast_capacity: usize,
    /// Larger inbound frames are dropped
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9091".to_string(),
            broadcast_capacity: 256,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames that failed to decode or exceeded the size limit
    pub malformed_frames: u64,
    /// Updates whose payload was not a valid update
    pub rejected_updates: u64,
    pub persisted_updates: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    malformed_frames: AtomicU64,
    rejected_updates: AtomicU64,
    persisted_updates: AtomicU64,
}

struct Shared {
    config: RelayConfig,
    state: RwLock<RelayState>,
    /// Guids already pulled from the backend
    loaded: parking_lot::Mutex<HashSet<String>>,
    group: BroadcastGroup,
    backend: Option<Arc<dyn DocAdapter>>,
    stats: AtomicRelayStats,
}

pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    /// In-memory relay.
    pub fn new(config: RelayConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Relay that loads guids from `backend` on first touch and persists
    /// every accepted update into it.
    pub fn with_backend(config: RelayConfig, backend: Arc<dyn DocAdapter>) -> Self {
        Self::build(config, Some(backend))
    }

    fn build(config: RelayConfig, backend: Option<Arc<dyn DocAdapter>>) -> Self {
        let group = BroadcastGroup::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(RelayState::new()),
                loaded: parking_lot::Mutex::new(HashSet::new()),
                group,
                backend,
                stats: AtomicRelayStats::default(),
            }),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> SyncResult<()> {
        let addr = &self.shared.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::Protocol(format!("bind {addr}: {e}")))?;
        log::info!("Relay listening on {addr}");
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> SyncResult<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| SyncError::Protocol(format!("accept: {e}")))?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Current merged update for `guid`.
    pub async fn doc_update(&self, guid: &str) -> Option<Vec<u8>> {
        self.shared.state.read().await.get(guid).map(<[u8]>::to_vec)
    }

    pub async fn guids(&self) -> Vec<String> {
        self.shared.state.read().await.guids()
    }

    pub fn stats(&self) -> RelayStats {
        let s = &self.shared.stats;
        RelayStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            malformed_frames: s.malformed_frames.load(Ordering::Relaxed),
            rejected_updates: s.rejected_updates.load(Ordering::Relaxed),
            persisted_updates: s.persisted_updates.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }
}

impl Shared {
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> SyncResult<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let info = PeerInfo::new(addr);
        let conn_id = info.peer_id;
        let mut broadcast_rx = self.group.add_peer(info).await;
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {conn_id} established from {addr}");

        let result: SyncResult<()> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            if let Some(reply) = self.handle_frame(conn_id, &bytes).await {
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn_id} closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },

                    out = broadcast_rx.recv() => match out {
                        Ok(outbound) => {
                            // Don't echo back to sender
                            if outbound.sender == conn_id {
                                continue;
                            }
                            ws_sender.send(Message::Binary(outbound.frame.clone().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn_id} lagged by {n} frames");
                            self.group.record_dropped(n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            Ok(())
        }
        .await;

        self.group.remove_peer(&conn_id).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Process one inbound frame. Returns the frame to send back, if any.
    async fn handle_frame(&self, conn_id: Uuid, bytes: &[u8]) -> Option<Vec<u8>> {
        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        if bytes.len() > self.config.max_frame_bytes {
            log::warn!("Dropping {} byte frame from {conn_id}: over limit", bytes.len());
            self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let msg = match WireMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode frame from {conn_id}: {e}");
                self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        log::trace!("{:?} from {conn_id}", msg.message_type());

        match msg {
            WireMessage::Ping => encode(&WireMessage::Pong),
            WireMessage::Pong => None,
            WireMessage::Diff { guid, payload } => {
                self.ensure_loaded(&guid).await;
                let outcome = self.state.write().await.handle_diff(&guid, payload.as_deref());
                if let Some(merged) = outcome.broadcast {
                    if let Some(payload) = &payload {
                        self.persist(&guid, payload).await;
                    }
                    self.fan_out(conn_id, &guid, merged);
                }
                outcome
                    .reply
                    .and_then(|reply| encode(&WireMessage::diff(guid, Some(reply))))
            }
            WireMessage::Update { guid, update } => {
                self.ensure_loaded(&guid).await;
                let accepted = self.state.write().await.handle_update(&guid, &update);
                match accepted {
                    Ok(()) => {
                        self.persist(&guid, &update).await;
                        self.fan_out(conn_id, &guid, update);
                    }
                    Err(e) => {
                        log::warn!("Rejected update for {guid} from {conn_id}: {e}");
                        self.stats.rejected_updates.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None
            }
        }
    }

    fn fan_out(&self, conn_id: Uuid, guid: &str, update: Vec<u8>) {
        if let Some(frame) = encode(&WireMessage::update(guid, update)) {
            self.group.broadcast(conn_id, frame);
        }
    }

    /// Pull `guid` from the backend the first time any connection touches it.
    async fn ensure_loaded(&self, guid: &str) {
        let Some(backend) = &self.backend else {
            return;
        };
        if self.loaded.lock().contains(guid) {
            return;
        }
        match backend.query_doc_state(guid, None).await {
            Ok(stored) => {
                let mut state = self.state.write().await;
                // Another connection may have loaded it while we were querying
                if !self.loaded.lock().insert(guid.to_string()) {
                    return;
                }
                if update::is_empty(&stored.missing_update) {
                    return;
                }
                match state.handle_update(guid, &stored.missing_update) {
                    Ok(()) => log::info!("Loaded {guid} from backend"),
                    Err(e) => log::error!("Stored state for {guid} is unreadable: {e}"),
                }
            }
            // Not marked loaded, so the next touch retries
            Err(e) => log::error!("Failed to load {guid} from backend: {e}"),
        }
    }

    async fn persist(&self, guid: &str, update: &[u8]) {
        let Some(backend) = &self.backend else {
            return;
        };
        match backend.send_doc_update(guid, update, RELAY_ORIGIN).await {
            Ok(()) => {
                self.stats.persisted_updates.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::error!("Failed to persist update for {guid}: {e}"),
        }
    }
}

fn encode(msg: &WireMessage) -> Option<Vec<u8>> {
    match msg.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("Failed to encode {:?}: {e}", msg.message_type());
            None
        }
    }
}
