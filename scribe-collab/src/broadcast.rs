//! Version-bump fan-out, one room per document.
//!
//! Uses tokio broadcast channels so a push notifies every subscriber with a
//! single send. A lagging subscriber only loses notifications, never steps:
//! the bump just tells it to pull.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::VersionBump;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub bumps_sent: u64,
    pub bumps_unobserved: u64,
    pub subscribers: usize,
}

/// A broadcast group for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<VersionBump>,
    capacity: usize,
    bumps_sent: AtomicU64,
    bumps_unobserved: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how many bumps a subscriber may fall behind before
    /// it starts skipping (it then sees `RecvError::Lagged`).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            bumps_sent: AtomicU64::new(0),
            bumps_unobserved: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VersionBump> {
        self.sender.subscribe()
    }

    /// Publish a bump. Returns the number of subscribers reached.
    pub fn publish(&self, bump: VersionBump) -> usize {
        self.bumps_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(bump) {
            Ok(count) => count,
            Err(_) => {
                self.bumps_unobserved.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            bumps_sent: self.bumps_sent.load(Ordering::Relaxed),
            bumps_unobserved: self.bumps_unobserved.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Maps document names to broadcast groups so notifications stay isolated
/// per document.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Subscribe to a document's room, creating it if needed. The receiver is
    /// registered under the map lock, so pruning never orphans it.
    pub async fn subscribe(&self, doc_name: &str) -> broadcast::Receiver<VersionBump> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_name) {
                return room.subscribe();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(doc_name.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .subscribe()
    }

    /// Publish to a room if it exists. Rooms nobody subscribed to are not created.
    pub async fn publish(&self, bump: VersionBump) -> usize {
        let room = self.rooms.read().await.get(&bump.doc_name).cloned();
        match room {
            Some(room) => room.publish(bump),
            None => 0,
        }
    }

    /// Remove a room that has no subscribers left.
    pub async fn remove_if_empty(&self, doc_name: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_name) {
            if room.subscriber_count() == 0 {
                rooms.remove(doc_name);
                return true;
            }
        }
        false
    }

    /// Drop every room without subscribers. Returns how many were removed.
    pub async fn prune_empty(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, room| room.subscriber_count() > 0);
        before - rooms.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
