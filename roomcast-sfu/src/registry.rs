//! Room registry - process-wide table of rooms and live sessions
//!
//! This module provides:
//! - Lazy room creation on first join, deletion when the last peer leaves
//! - Reverse index from peer to room for O(1) scope lookup
//! - Table of every live session (global broadcast scope)
//! - Room and peer limit enforcement
//!
//! Joining inserts the peer while holding the room's map entry and room
//! removal is a conditional remove-if-empty, so a concurrent join can never
//! land in a room that has just been deleted.

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::peer::PeerSession;
use crate::room::{Room, RoomStats};
use crate::types::{PeerId, ProducerInfo, RoomId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub joined_peers: usize,
    pub connected_peers: usize,
}

/// Result of removing a peer from its room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: RoomId,
    /// Room was empty afterwards and has been deleted
    pub room_removed: bool,
}

pub struct RoomRegistry {
    config: Arc<SfuConfig>,

    /// Active rooms
    rooms: DashMap<RoomId, Arc<Room>>,

    /// peer -> room reverse index
    peer_rooms: DashMap<PeerId, RoomId>,

    /// Every connected session, joined or not
    sessions: DashMap<PeerId, Arc<PeerSession>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(config: Arc<SfuConfig>) -> Self {
        info!(
            rooms_enabled = config.rooms_enabled,
            max_rooms = config.max_rooms,
            max_peers_per_room = config.max_peers_per_room,
            "Room registry initialized"
        );
        Self {
            config,
            rooms: DashMap::new(),
            peer_rooms: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Track a newly connected session
    pub fn register_session(&self, session: Arc<PeerSession>) {
        self.sessions.insert(session.id().clone(), session);
    }

    pub fn remove_session(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.remove(peer_id).map(|(_, session)| session)
    }

    #[must_use]
    pub fn session(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.get(peer_id).map(|s| Arc::clone(s.value()))
    }

    /// Point-in-time copy of every live session
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Add a peer to a room, creating the room on first join
    pub fn join(&self, room_id: &RoomId, peer: Arc<PeerSession>) -> Result<Arc<Room>> {
        let peer_id = peer.id().clone();
        // checked before taking the entry: len() would wait on the shard we hold
        let at_room_limit =
            self.config.max_rooms > 0 && self.rooms.len() >= self.config.max_rooms;
        let room = match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => {
                let room = entry.get();
                let peer_count = room.peer_count();
                if self.config.max_peers_per_room > 0
                    && peer_count >= self.config.max_peers_per_room
                    && !room.contains(&peer_id)
                {
                    warn!(
                        room_id = %room_id,
                        current_peers = peer_count,
                        max_peers = self.config.max_peers_per_room,
                        "Peer limit reached for room"
                    );
                    return Err(SfuError::RoomFull(room_id.clone()));
                }
                room.add_peer(peer);
                Arc::clone(room)
            }
            Entry::Vacant(entry) => {
                if at_room_limit {
                    warn!(
                        max_rooms = self.config.max_rooms,
                        "Room limit reached"
                    );
                    return Err(SfuError::RoomLimitReached);
                }
                let room = Arc::new(Room::new(room_id.clone()));
                room.add_peer(peer);
                info!(room_id = %room_id, "Created new room");
                Arc::clone(entry.insert(room).value())
            }
        };
        self.peer_rooms.insert(peer_id.clone(), room_id.clone());

        debug!(
            room_id = %room_id,
            peer_id = %peer_id,
            peer_count = room.peer_count(),
            "Added peer to room"
        );
        Ok(room)
    }

    /// Remove a peer from whatever room it is in; deletes the room if empty
    pub fn leave(&self, peer_id: &PeerId) -> Option<Departure> {
        let (_, room_id) = self.peer_rooms.remove(peer_id)?;

        let Some(room) = self.room(&room_id) else {
            debug!(room_id = %room_id, "Room not found when removing peer");
            return None;
        };
        room.remove_peer(peer_id);

        let room_removed = self
            .rooms
            .remove_if(&room_id, |_, room| room.is_empty())
            .is_some();

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            room_removed,
            "Removed peer from room"
        );

        Some(Departure {
            room_id,
            room_removed,
        })
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn room_of(&self, peer_id: &PeerId) -> Option<RoomId> {
        self.peer_rooms.get(peer_id).map(|r| r.value().clone())
    }

    /// Members of a room, optionally excluding one peer
    #[must_use]
    pub fn room_peer_ids(&self, room_id: &RoomId, excluding: Option<&PeerId>) -> Vec<PeerId> {
        self.room(room_id)
            .map(|room| room.peer_ids(excluding))
            .unwrap_or_default()
    }

    /// Every live session id, optionally excluding one peer
    #[must_use]
    pub fn session_ids(&self, excluding: Option<&PeerId>) -> Vec<PeerId> {
        self.sessions
            .iter()
            .map(|s| s.key().clone())
            .filter(|id| Some(id) != excluding)
            .collect()
    }

    /// Room snapshot: live producers of every other peer in the room
    #[must_use]
    pub fn producers_for_room(&self, room_id: &RoomId, excluding: Option<&PeerId>) -> Vec<ProducerInfo> {
        self.room(room_id)
            .map(|room| room.producers(excluding))
            .unwrap_or_default()
    }

    /// Global snapshot: live producers of every other session
    #[must_use]
    pub fn all_producers(&self, excluding: Option<&PeerId>) -> Vec<ProducerInfo> {
        self.sessions()
            .iter()
            .filter(|session| Some(session.id()) != excluding)
            .flat_map(|session| session.producer_infos())
            .collect()
    }

    #[must_use]
    pub fn get_room_stats(&self, room_id: &RoomId) -> Option<RoomStats> {
        self.room(room_id).map(|room| room.get_stats())
    }

    #[must_use]
    pub fn get_room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn get_stats(&self) -> RegistryStats {
        RegistryStats {
            active_rooms: self.rooms.len(),
            joined_peers: self.peer_rooms.len(),
            connected_peers: self.sessions.len(),
        }
    }
}
