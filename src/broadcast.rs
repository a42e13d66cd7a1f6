//! Fan-out broadcast to the peers of one room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; lagging peers drop the oldest frames (backpressure).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PresenceError, RelayMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_peers: usize,
}

/// Atomic counters — lock-free on the send path.
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single room.
///
/// All peers in the same room share one broadcast channel. When a peer
/// sends a frame, it is fanned out to every subscriber; echo
/// suppression is the receiving side's job.
pub struct BroadcastGroup {
    /// Broadcast channel sender (one per room)
    sender: broadcast::Sender<Arc<Vec<u8>>>,

    /// Peers currently subscribed, with their join instants
    peers: Arc<RwLock<HashMap<Uuid, Instant>>>,

    /// Frames buffered per receiver before lagging starts dropping
    capacity: usize,

    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Subscribe a peer to this group.
    ///
    /// Returns the receiver the peer consumes frames from.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(peer_id, Instant::now());
        self.sender.subscribe()
    }

    /// Remove a peer from this group.
    ///
    /// Returns `true` if the peer was subscribed.
    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        let mut peers = self.peers.write().await;
        peers.remove(peer_id).is_some()
    }

    /// Fan out a pre-encoded frame. Lock-free.
    ///
    /// Returns the number of receivers the frame reached.
    pub fn send_frame(&self, frame: Arc<Vec<u8>>) -> usize {
        match self.sender.send(frame) {
            Ok(count) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                // No live receivers
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Encode a message and fan it out.
    pub fn send_message(&self, msg: &RelayMessage) -> Result<usize, PresenceError> {
        let encoded = msg.encode()?;
        Ok(self.send_frame(Arc::new(encoded)))
    }

    /// Current number of subscribed peers.
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Check whether a peer is subscribed.
    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Ids of all subscribed peers.
    pub async fn peer_ids(&self) -> Vec<Uuid> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// Broadcast statistics snapshot.
    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    /// The channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a peer (raw receiver).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
