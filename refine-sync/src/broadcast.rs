//! Fan-out of relay frames to every connection but the sender.
//!
//! One tokio broadcast channel carries pre-encoded frames tagged with the
//! originating connection id. Each connection filters out its own frames,
//! so the send path is a single channel push regardless of peer count.
//!
//! Performance target: 1,000 frames to 100 peers < 10ms
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// A frame on its way to peers.
#[derive(Debug)]
pub struct Outbound {
    /// Connection that caused the frame; it never receives it back
    pub sender: Uuid,
    pub frame: Vec<u8>,
}

/// Connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub addr: SocketAddr,
    pub connected_at: Instant,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            addr,
            connected_at: Instant::now(),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outbound>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per peer before a lagging peer starts
    /// losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and hand back its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Outbound>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Queue `frame` for every peer. Returns the receiver count, which
    /// includes the sender; filtering happens on receive.
    pub fn broadcast(&self, sender: Uuid, frame: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Outbound { sender, frame }))
            .unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerInfo {
        PeerInfo::new("127.0.0.1:9000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let info = peer();
        let id = info.peer_id;

        let _rx = group.add_peer(info).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        assert!(group.remove_peer(&id).await.is_some());
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_tags_sender() {
        let group = BroadcastGroup::new(16);
        let a = peer();
        let b = peer();
        let a_id = a.peer_id;
        let mut rx_a = group.add_peer(a).await;
        let mut rx_b = group.add_peer(b).await;

        assert_eq!(group.broadcast(a_id, vec![1, 2, 3]), 2);

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a.sender, a_id);
        assert_eq!(got_b.frame, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(peer()).await;
        for i in 0..5u8 {
            group.broadcast(Uuid::nil(), vec![i]);
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
    }
}
