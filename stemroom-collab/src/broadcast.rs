//! Fan-out of encoded frames to every admitted connection of a room.
//!
//! One tokio broadcast channel per room; each connection holds its own
//! receiver buffering up to `capacity` frames. A receiver that falls
//! further behind gets `Lagged` and must resync from the room state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use stemroom_core::Identity;

use crate::protocol::{ProtocolError, SyncMessage};

/// An encoded message plus the connection it came from.
///
/// Connections skip frames whose `origin` is themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub origin: Option<Uuid>,
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn is_from(&self, connection_id: Uuid) -> bool {
        self.origin == Some(connection_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters updated on the hot path without taking the peer lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The replica set of one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    peers: Arc<RwLock<HashMap<Uuid, Identity>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Admit a connection. Frames sent after this call reach the returned
    /// receiver.
    pub async fn add_peer(
        &self,
        connection_id: Uuid,
        identity: Identity,
    ) -> broadcast::Receiver<Arc<Frame>> {
        let mut peers = self.peers.write().await;
        peers.insert(connection_id, identity);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<Identity> {
        self.peers.write().await.remove(connection_id)
    }

    /// Encode and send to every receiver. Returns the receiver count.
    pub fn broadcast(
        &self,
        msg: &SyncMessage,
        origin: Option<Uuid>,
    ) -> Result<usize, ProtocolError> {
        let frame = Frame {
            origin,
            bytes: msg.encode()?,
        };
        Ok(self.broadcast_frame(Arc::new(frame)))
    }

    /// Send an already encoded frame.
    pub fn broadcast_frame(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver never saw.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<(Uuid, Identity)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, identity)| (*id, identity.clone()))
            .collect()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
