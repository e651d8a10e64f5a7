//! Notification fanout
//!
//! Routes server events to connected peers. Each connection registers one
//! unbounded channel; events are scoped either to the origin's room or, when
//! rooms are disabled, to every connected peer.

use crate::registry::RoomRegistry;
use crate::signaling::ServerEvent;
use crate::types::{PeerId, RoomId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Message sender for a peer connection
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Receiving half handed to the connection
pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

/// Set of peers an event is delivered to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Members of one room
    Room(RoomId),
    /// Every connected peer
    Global,
}

pub struct NotificationFanout {
    /// peer_id -> event channel
    subscribers: DashMap<PeerId, EventSender>,
    registry: Arc<RoomRegistry>,
}

impl NotificationFanout {
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            subscribers: DashMap::new(),
            registry,
        }
    }

    /// Register a peer's event channel. Replaces any previous channel.
    pub fn register(&self, peer_id: PeerId) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.subscribers.insert(peer_id.clone(), tx).is_some() {
            warn!(peer_id = %peer_id, "Replaced existing event channel");
        }
        debug!(peer_id = %peer_id, "Event channel registered");
        rx
    }

    /// Drop a peer's event channel
    pub fn unregister(&self, peer_id: &PeerId) -> bool {
        let removed = self.subscribers.remove(peer_id).is_some();
        if removed {
            debug!(peer_id = %peer_id, "Event channel unregistered");
        }
        removed
    }

    #[must_use]
    pub fn is_registered(&self, peer_id: &PeerId) -> bool {
        self.subscribers.contains_key(peer_id)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Broadcast scope of a peer: its room in room mode, everyone otherwise.
    /// `None` if rooms are enabled and the peer has not joined one.
    #[must_use]
    pub fn scope_of(&self, peer_id: &PeerId) -> Option<Scope> {
        if self.registry.config().rooms_enabled {
            self.registry.room_of(peer_id).map(Scope::Room)
        } else {
            Some(Scope::Global)
        }
    }

    /// Send one event to one peer
    pub fn send_to(&self, peer_id: &PeerId, event: ServerEvent) -> bool {
        let delivered = match self.subscribers.get(peer_id) {
            Some(sender) => sender.send(event).is_ok(),
            None => return false,
        };
        if !delivered {
            warn!(peer_id = %peer_id, "Event channel closed, removing subscriber");
            self.subscribers.remove(peer_id);
        }
        delivered
    }

    /// Broadcast in the origin's scope, never back to the origin
    pub fn publish(&self, origin: &PeerId, event: ServerEvent) -> usize {
        match self.scope_of(origin) {
            Some(scope) => self.publish_in(&scope, Some(origin), event),
            None => {
                debug!(
                    peer_id = %origin,
                    event_type = event.event_type(),
                    "Origin has no broadcast scope, event dropped"
                );
                0
            }
        }
    }

    /// Broadcast to every peer in `scope` except `except`
    pub fn publish_in(&self, scope: &Scope, except: Option<&PeerId>, event: ServerEvent) -> usize {
        let recipients: Vec<PeerId> = match scope {
            Scope::Room(room_id) => self.registry.room_peer_ids(room_id, except),
            Scope::Global => self
                .subscribers
                .iter()
                .map(|entry| entry.key().clone())
                .filter(|id| Some(id) != except)
                .collect(),
        };

        let mut sent_count = 0;
        let mut failed = Vec::new();
        for peer_id in recipients {
            let Some(sender) = self.subscribers.get(&peer_id).map(|s| s.value().clone()) else {
                continue;
            };
            match sender.send(event.clone()) {
                Ok(()) => sent_count += 1,
                Err(err) => {
                    warn!(
                        peer_id = %peer_id,
                        error = %err,
                        "Failed to send event to peer, marking for cleanup"
                    );
                    failed.push(peer_id);
                }
            }
        }

        for peer_id in failed {
            self.subscribers.remove(&peer_id);
        }

        if sent_count > 0 {
            debug!(
                scope = ?scope,
                sent_count,
                event_type = event.event_type(),
                "Event broadcast complete"
            );
        }
        sent_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::peer::PeerSession;

    fn setup(rooms_enabled: bool) -> (Arc<RoomRegistry>, NotificationFanout) {
        let registry = Arc::new(RoomRegistry::new(Arc::new(SfuConfig {
            rooms_enabled,
            ..SfuConfig::default()
        })));
        let fanout = NotificationFanout::new(Arc::clone(&registry));
        (registry, fanout)
    }

    fn joined(registry: &RoomRegistry, peer: &str, room: &str) {
        let session = Arc::new(PeerSession::new(PeerId::from(peer)));
        registry.join(&RoomId::from(room), session).unwrap();
    }

    fn left(peer: &str) -> ServerEvent {
        ServerEvent::PeerLeft {
            peer_id: PeerId::from(peer),
        }
    }

    #[tokio::test]
    async fn test_room_scoped_publish() {
        let (registry, fanout) = setup(true);
        joined(&registry, "a", "r1");
        joined(&registry, "b", "r1");
        joined(&registry, "c", "r2");

        let mut rx_a = fanout.register(PeerId::from("a"));
        let mut rx_b = fanout.register(PeerId::from("b"));
        let mut rx_c = fanout.register(PeerId::from("c"));

        let sent = fanout.publish(&PeerId::from("a"), left("x"));
        assert_eq!(sent, 1);
        assert_eq!(rx_b.recv().await.unwrap(), left("x"));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_global_publish() {
        let (_registry, fanout) = setup(false);
        let _rx_a = fanout.register(PeerId::from("a"));
        let mut rx_b = fanout.register(PeerId::from("b"));
        let mut rx_c = fanout.register(PeerId::from("c"));

        assert_eq!(fanout.publish(&PeerId::from("a"), left("a")), 2);
        assert_eq!(rx_b.recv().await.unwrap(), left("a"));
        assert_eq!(rx_c.recv().await.unwrap(), left("a"));
    }

    #[test]
    fn test_unjoined_origin_has_no_scope() {
        let (_registry, fanout) = setup(true);
        let _rx = fanout.register(PeerId::from("a"));
        assert_eq!(fanout.scope_of(&PeerId::from("a")), None);
        assert_eq!(fanout.publish(&PeerId::from("a"), left("a")), 0);
    }

    #[test]
    fn test_dead_channels_are_pruned() {
        let (_registry, fanout) = setup(false);
        let rx = fanout.register(PeerId::from("a"));
        drop(rx);

        assert_eq!(fanout.publish_in(&Scope::Global, None, left("z")), 0);
        assert!(!fanout.is_registered(&PeerId::from("a")));

        let rx = fanout.register(PeerId::from("b"));
        drop(rx);
        assert!(!fanout.send_to(&PeerId::from("b"), left("z")));
        assert_eq!(fanout.subscriber_count(), 0);
    }
}
