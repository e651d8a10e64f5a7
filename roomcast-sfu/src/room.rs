//! Room membership

use crate::peer::PeerSession;
use crate::types::{PeerId, ProducerInfo, RoomId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Named group of peers sharing a broadcast scope
pub struct Room {
    pub id: RoomId,
    created_at: DateTime<Utc>,
    peers: RwLock<HashMap<PeerId, Arc<PeerSession>>>,
    total_peers_joined: AtomicU64,
}

impl Room {
    #[must_use]
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            peers: RwLock::new(HashMap::new()),
            total_peers_joined: AtomicU64::new(0),
        }
    }

    /// Insert a peer. Returns false if it was already a member.
    pub fn add_peer(&self, peer: Arc<PeerSession>) -> bool {
        let inserted = self.peers.write().insert(peer.id().clone(), peer).is_none();
        if inserted {
            self.total_peers_joined.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.peers.write().remove(peer_id)
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Member ids, optionally leaving one out
    #[must_use]
    pub fn peer_ids(&self, excluding: Option<&PeerId>) -> Vec<PeerId> {
        self.peers
            .read()
            .keys()
            .filter(|id| Some(*id) != excluding)
            .cloned()
            .collect()
    }

    /// Point-in-time copy of the member sessions
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<PeerSession>> {
        self.peers.read().values().cloned().collect()
    }

    /// Live producers of every member except `excluding`. Reads the session
    /// maps directly; nothing is cached.
    #[must_use]
    pub fn producers(&self, excluding: Option<&PeerId>) -> Vec<ProducerInfo> {
        self.peers()
            .iter()
            .filter(|peer| Some(peer.id()) != excluding)
            .flat_map(|peer| peer.producer_infos())
            .collect()
    }

    #[must_use]
    pub fn get_stats(&self) -> RoomStats {
        RoomStats {
            room_id: self.id.clone(),
            peer_count: self.peer_count(),
            total_peers_joined: self.total_peers_joined.load(Ordering::Relaxed),
            producer_count: self.producers(None).len(),
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("peer_count", &self.peer_count())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: RoomId,
    pub peer_count: usize,
    pub total_peers_joined: u64,
    pub producer_count: usize,
    pub created_at: DateTime<Utc>,
}
