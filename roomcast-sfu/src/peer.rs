//! Per-connection session state
//!
//! This module handles:
//! - Session lifecycle (`Connected` → `Joined` → `Disconnected`)
//! - Per-kind transport and producer slots, consumer table
//! - Per-pipeline serialization of engine calls
//! - Atomic teardown collection on disconnect
//!
//! All maps sit behind a single synchronous lock that is never held across
//! an await point. Every insertion re-checks the lifecycle state under that
//! lock, so engine results that arrive after disconnect are handed back to
//! the caller for closing instead of being stored.

use crate::engine::{Consumer, Producer, Transport};
use crate::error::{EngineError, Result, SfuError};
use crate::types::{
    ConsumerId, Direction, KindMap, MediaKind, PeerId, ProducerId, ProducerInfo, RoomId, TransportId,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::debug;

/// Lifecycle state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Joined(RoomId),
    Disconnected,
}

/// Outcome of a join request on the session itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Session moved from `Connected` to `Joined`
    Joined,
    /// Session was already in this room
    AlreadyMember,
}

/// Transport held in a per-kind slot
#[derive(Clone)]
pub struct TransportSlot {
    pub transport: Arc<dyn Transport>,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announced {
    Pending,
    Live,
    Retired,
}

/// Discovery state of a producer: `new-producer` goes out at most once,
/// `producer-closed` only after it and at most once.
///
/// The callbacks run under the state lock so the two announcements can
/// never be observed out of order.
#[derive(Debug)]
pub struct Announcement(Mutex<Announced>);

impl Default for Announcement {
    fn default() -> Self {
        Self(Mutex::new(Announced::Pending))
    }
}

impl Announcement {
    /// Run `announce` if the producer is neither published nor retired.
    pub fn publish(&self, announce: impl FnOnce()) -> bool {
        let mut state = self.0.lock();
        if *state != Announced::Pending {
            return false;
        }
        announce();
        *state = Announced::Live;
        true
    }

    /// Retire the producer, running `announce` only if it was published.
    /// Returns true for the call that retired it.
    pub fn retire(&self, announce: impl FnOnce()) -> bool {
        let mut state = self.0.lock();
        match *state {
            Announced::Retired => false,
            Announced::Live => {
                announce();
                *state = Announced::Retired;
                true
            }
            Announced::Pending => {
                *state = Announced::Retired;
                true
            }
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        *self.0.lock() == Announced::Live
    }
}

/// Producer held in a per-kind slot
#[derive(Clone)]
pub struct ProducerSlot {
    pub producer: Arc<dyn Producer>,
    pub paused: bool,
    pub announcement: Arc<Announcement>,
}

/// Consumer held in the consumer table
#[derive(Clone)]
pub struct ConsumerSlot {
    pub consumer: Arc<dyn Consumer>,
    /// Local mirror of the engine pause state. Consumers start paused.
    pub paused: Arc<AtomicBool>,
}

#[derive(Default)]
struct Resources {
    send_transports: KindMap<TransportSlot>,
    recv_transports: KindMap<TransportSlot>,
    producers: KindMap<ProducerSlot>,
    consumers: HashMap<ConsumerId, ConsumerSlot>,
}

struct Inner {
    state: SessionState,
    resources: Resources,
}

/// Everything a session owned at the moment it was torn down
#[derive(Default)]
pub struct Teardown {
    pub room_id: Option<RoomId>,
    pub producers: Vec<(MediaKind, ProducerSlot)>,
    pub consumers: Vec<ConsumerSlot>,
    pub send_transports: Vec<(MediaKind, TransportSlot)>,
    pub recv_transports: Vec<(MediaKind, TransportSlot)>,
}

/// Async locks serializing engine calls per (direction, kind) pipeline
#[derive(Default)]
struct Pipelines {
    send_audio: tokio::sync::Mutex<()>,
    send_video: tokio::sync::Mutex<()>,
    recv_audio: tokio::sync::Mutex<()>,
    recv_video: tokio::sync::Mutex<()>,
}

/// Resource bag of one connected client
pub struct PeerSession {
    id: PeerId,
    connected_at: DateTime<Utc>,
    inner: Mutex<Inner>,
    pipelines: Pipelines,
}

impl PeerSession {
    #[must_use]
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            connected_at: Utc::now(),
            inner: Mutex::new(Inner {
                state: SessionState::Connected,
                resources: Resources::default(),
            }),
            pipelines: Pipelines::default(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().state != SessionState::Disconnected
    }

    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match &self.inner.lock().state {
            SessionState::Joined(room_id) => Some(room_id.clone()),
            _ => None,
        }
    }

    /// Lock the pipeline for `direction`/`kind`. Held across the engine call.
    pub async fn lock_pipeline(&self, direction: Direction, kind: MediaKind) -> tokio::sync::MutexGuard<'_, ()> {
        let lock = match (direction, kind) {
            (Direction::Send, MediaKind::Audio) => &self.pipelines.send_audio,
            (Direction::Send, MediaKind::Video) => &self.pipelines.send_video,
            (Direction::Recv, MediaKind::Audio) => &self.pipelines.recv_audio,
            (Direction::Recv, MediaKind::Video) => &self.pipelines.recv_video,
        };
        lock.lock().await
    }

    /// Move `Connected` → `Joined(room_id)`
    pub fn begin_join(&self, room_id: &RoomId) -> Result<JoinOutcome> {
        let mut inner = self.inner.lock();
        match &inner.state {
            SessionState::Connected => {}
            SessionState::Joined(current) if current == room_id => {
                return Ok(JoinOutcome::AlreadyMember);
            }
            SessionState::Joined(current) => return Err(SfuError::AlreadyJoined(current.clone())),
            SessionState::Disconnected => return Err(SfuError::SessionClosed),
        }
        inner.state = SessionState::Joined(room_id.clone());
        Ok(JoinOutcome::Joined)
    }

    /// Undo [`begin_join`](Self::begin_join) after the registry refused the peer
    pub fn abort_join(&self, room_id: &RoomId) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Joined(room_id.clone()) {
            inner.state = SessionState::Connected;
        }
    }

    /// Precondition for media operations
    pub fn ensure_ready(&self, require_room: bool) -> Result<()> {
        match &self.inner.lock().state {
            SessionState::Disconnected => Err(SfuError::SessionClosed),
            SessionState::Connected if require_room => Err(SfuError::NotJoined),
            _ => Ok(()),
        }
    }

    fn open_resources(&self) -> Result<parking_lot::MappedMutexGuard<'_, Resources>> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Disconnected {
            return Err(SfuError::SessionClosed);
        }
        Ok(parking_lot::MutexGuard::map(inner, |inner| &mut inner.resources))
    }

    fn transports_mut(resources: &mut Resources, direction: Direction) -> &mut KindMap<TransportSlot> {
        match direction {
            Direction::Send => &mut resources.send_transports,
            Direction::Recv => &mut resources.recv_transports,
        }
    }

    pub fn has_transport(&self, direction: Direction, kind: MediaKind) -> Result<bool> {
        let mut resources = self.open_resources()?;
        Ok(Self::transports_mut(&mut resources, direction).contains(kind))
    }

    pub fn transport(&self, direction: Direction, kind: MediaKind) -> Result<TransportSlot> {
        let mut resources = self.open_resources()?;
        Self::transports_mut(&mut resources, direction)
            .get(kind)
            .cloned()
            .ok_or(SfuError::NoSuchTransport { direction, kind })
    }

    /// Store a freshly created transport. On error the transport is handed
    /// back so the caller can close it.
    pub fn install_transport(
        &self,
        direction: Direction,
        kind: MediaKind,
        transport: Arc<dyn Transport>,
    ) -> std::result::Result<(), (SfuError, Arc<dyn Transport>)> {
        let mut resources = match self.open_resources() {
            Ok(resources) => resources,
            Err(err) => return Err((err, transport)),
        };
        let slots = Self::transports_mut(&mut resources, direction);
        if slots.contains(kind) {
            return Err((SfuError::TransportExists { direction, kind }, transport));
        }
        slots.insert(kind, TransportSlot { transport, connected: false });
        Ok(())
    }

    pub fn mark_connected(&self, direction: Direction, kind: MediaKind) -> Result<()> {
        let mut resources = self.open_resources()?;
        let slot = Self::transports_mut(&mut resources, direction)
            .get_mut(kind)
            .ok_or(SfuError::NoSuchTransport { direction, kind })?;
        slot.connected = true;
        Ok(())
    }

    /// Remove the transport of `direction`/`kind` only if it is still `transport_id`
    pub fn remove_transport(
        &self,
        direction: Direction,
        kind: MediaKind,
        transport_id: &TransportId,
    ) -> Option<TransportSlot> {
        let mut inner = self.inner.lock();
        Self::transports_mut(&mut inner.resources, direction)
            .take_if(kind, |slot| slot.transport.id() == transport_id)
    }

    pub fn take_producer(&self, kind: MediaKind) -> Result<Option<ProducerSlot>> {
        Ok(self.open_resources()?.producers.take(kind))
    }

    /// Store a new producer. Fails if the session closed meanwhile.
    pub fn install_producer(
        &self,
        kind: MediaKind,
        slot: ProducerSlot,
    ) -> std::result::Result<(), (SfuError, ProducerSlot)> {
        let mut resources = match self.open_resources() {
            Ok(resources) => resources,
            Err(err) => return Err((err, slot)),
        };
        // closed between produce() and now
        if slot.producer.is_closed() {
            return Err((SfuError::Engine(EngineError::Closed), slot));
        }
        if let Some(previous) = resources.producers.insert(kind, slot) {
            debug!(
                peer_id = %self.id,
                producer_id = %previous.producer.id(),
                "Replaced producer slot still occupied"
            );
        }
        Ok(())
    }

    /// Remove the producer of `kind` only if it is still `producer_id`
    pub fn remove_producer(&self, kind: MediaKind, producer_id: &ProducerId) -> Option<ProducerSlot> {
        let mut inner = self.inner.lock();
        inner
            .resources
            .producers
            .take_if(kind, |slot| slot.producer.id() == producer_id)
    }

    pub fn producer(&self, kind: MediaKind) -> Result<ProducerSlot> {
        self.open_resources()?
            .producers
            .get(kind)
            .cloned()
            .ok_or(SfuError::NoProducerOfKind(kind))
    }

    pub fn set_producer_paused(&self, kind: MediaKind, paused: bool) -> Result<()> {
        let mut resources = self.open_resources()?;
        let slot = resources
            .producers
            .get_mut(kind)
            .ok_or(SfuError::NoProducerOfKind(kind))?;
        slot.paused = paused;
        Ok(())
    }

    /// Live producer with the given id, if this session owns it
    #[must_use]
    pub fn find_producer(&self, producer_id: &ProducerId) -> Option<ProducerSlot> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Disconnected {
            return None;
        }
        let found = inner
            .resources
            .producers
            .iter()
            .map(|(_, slot)| slot)
            .find(|slot| slot.producer.id() == producer_id && !slot.producer.is_closed())
            .cloned();
        found
    }

    /// Discovery tuples for every live producer of this session
    #[must_use]
    pub fn producer_infos(&self) -> Vec<ProducerInfo> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Disconnected {
            return Vec::new();
        }
        inner
            .resources
            .producers
            .iter()
            .filter(|(_, slot)| !slot.producer.is_closed())
            .map(|(kind, slot)| ProducerInfo {
                producer_id: slot.producer.id().clone(),
                producer_socket_id: self.id.clone(),
                kind,
            })
            .collect()
    }

    /// Store a new consumer. Fails if the session closed meanwhile.
    pub fn install_consumer(&self, slot: ConsumerSlot) -> std::result::Result<(), (SfuError, ConsumerSlot)> {
        let mut resources = match self.open_resources() {
            Ok(resources) => resources,
            Err(err) => return Err((err, slot)),
        };
        resources.consumers.insert(slot.consumer.id().clone(), slot);
        Ok(())
    }

    pub fn consumer(&self, consumer_id: &ConsumerId) -> Result<ConsumerSlot> {
        self.open_resources()?
            .consumers
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| SfuError::NoSuchConsumer(consumer_id.clone()))
    }

    pub fn remove_consumer(&self, consumer_id: &ConsumerId) -> Option<ConsumerSlot> {
        self.inner.lock().resources.consumers.remove(consumer_id)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().resources.consumers.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.inner.lock().resources.producers.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.resources.send_transports.len() + inner.resources.recv_transports.len()
    }

    /// Transition to `Disconnected` and take ownership of every resource.
    /// Returns `None` if the session was already torn down.
    pub fn close(&self) -> Option<Teardown> {
        let mut inner = self.inner.lock();
        let room_id = match std::mem::replace(&mut inner.state, SessionState::Disconnected) {
            SessionState::Disconnected => return None,
            SessionState::Joined(room_id) => Some(room_id),
            SessionState::Connected => None,
        };
        let resources = &mut inner.resources;
        Some(Teardown {
            room_id,
            producers: resources.producers.drain(),
            consumers: resources.consumers.drain().map(|(_, slot)| slot).collect(),
            send_transports: resources.send_transports.drain(),
            recv_transports: resources.recv_transports.drain(),
        })
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl ProducerSlot {
    #[must_use]
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self {
            producer,
            paused: false,
            announcement: Arc::new(Announcement::default()),
        }
    }
}

impl ConsumerSlot {
    #[must_use]
    pub fn new(consumer: Arc<dyn Consumer>) -> Self {
        Self {
            consumer,
            paused: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{MediaEngine, TransportOptions};
    use crate::loopback::LoopbackEngine;
    use crate::types::RtpParameters;

    async fn transport(engine: &LoopbackEngine, direction: Direction, kind: MediaKind) -> Arc<dyn Transport> {
        engine
            .create_transport(TransportOptions {
                peer_id: PeerId::from("p"),
                direction,
                kind,
                engine: EngineConfig::default(),
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_join_transitions() {
        let session = PeerSession::new(PeerId::from("peer1"));
        let r1 = RoomId::from("r1");
        let r2 = RoomId::from("r2");

        assert_eq!(session.begin_join(&r1).unwrap(), JoinOutcome::Joined);
        assert_eq!(session.begin_join(&r1).unwrap(), JoinOutcome::AlreadyMember);
        assert_eq!(session.begin_join(&r2), Err(SfuError::AlreadyJoined(r1.clone())));
        assert_eq!(session.room_id(), Some(r1));

        let teardown = session.close().unwrap();
        assert_eq!(teardown.room_id, Some(RoomId::from("r1")));
        assert_eq!(session.begin_join(&r2), Err(SfuError::SessionClosed));
        assert!(session.close().is_none());
    }

    #[test]
    fn test_abort_join_only_reverts_matching_room() {
        let session = PeerSession::new(PeerId::from("peer1"));
        let r1 = RoomId::from("r1");
        session.begin_join(&r1).unwrap();

        session.abort_join(&RoomId::from("other"));
        assert_eq!(session.state(), SessionState::Joined(r1.clone()));

        session.abort_join(&r1);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_ensure_ready() {
        let session = PeerSession::new(PeerId::from("peer1"));
        assert_eq!(session.ensure_ready(true), Err(SfuError::NotJoined));
        assert!(session.ensure_ready(false).is_ok());

        session.close();
        assert_eq!(session.ensure_ready(false), Err(SfuError::SessionClosed));
    }

    #[tokio::test]
    async fn test_transport_slots() {
        let engine = LoopbackEngine::new(EngineConfig::default());
        let session = PeerSession::new(PeerId::from("peer1"));

        let t1 = transport(&engine, Direction::Send, MediaKind::Video).await;
        assert!(session.install_transport(Direction::Send, MediaKind::Video, t1).is_ok());

        let t2 = transport(&engine, Direction::Send, MediaKind::Video).await;
        let (err, _returned) = session
            .install_transport(Direction::Send, MediaKind::Video, t2)
            .unwrap_err();
        assert_eq!(
            err,
            SfuError::TransportExists {
                direction: Direction::Send,
                kind: MediaKind::Video
            }
        );

        // receive side is independent
        assert!(!session.has_transport(Direction::Recv, MediaKind::Video).unwrap());
        assert!(!session.transport(Direction::Send, MediaKind::Video).unwrap().connected);
        session.mark_connected(Direction::Send, MediaKind::Video).unwrap();
        assert!(session.transport(Direction::Send, MediaKind::Video).unwrap().connected);
    }

    #[tokio::test]
    async fn test_install_after_close_hands_resource_back() {
        let engine = LoopbackEngine::new(EngineConfig::default());
        let session = PeerSession::new(PeerId::from("peer1"));
        session.close();

        let t = transport(&engine, Direction::Recv, MediaKind::Audio).await;
        let (err, returned) = session
            .install_transport(Direction::Recv, MediaKind::Audio, t)
            .unwrap_err();
        assert_eq!(err, SfuError::SessionClosed);
        returned.close().unwrap();
        assert_eq!(engine.live_transports(), 0);
    }

    #[tokio::test]
    async fn test_producer_infos_and_teardown() {
        let engine = LoopbackEngine::new(EngineConfig::default());
        let session = PeerSession::new(PeerId::from("peer1"));
        let t = transport(&engine, Direction::Send, MediaKind::Audio).await;
        let producer = t
            .produce(MediaKind::Audio, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();
        let producer_id = producer.id().clone();

        session
            .install_transport(Direction::Send, MediaKind::Audio, t)
            .map_err(|(e, _)| e)
            .unwrap();
        session
            .install_producer(MediaKind::Audio, ProducerSlot::new(producer))
            .map_err(|(e, _)| e)
            .unwrap();

        let infos = session.producer_infos();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].producer_id, producer_id);
        assert!(session.find_producer(&producer_id).is_some());

        let teardown = session.close().unwrap();
        assert_eq!(teardown.producers.len(), 1);
        assert_eq!(teardown.send_transports.len(), 1);
        let slot = &teardown.producers[0].1;
        assert!(slot.announcement.retire(|| panic!("never published")));
        assert!(!slot.announcement.retire(|| panic!("already retired")));
        assert_eq!(session.producer_count(), 0);
        assert_eq!(session.transport_count(), 0);
        assert!(session.producer_infos().is_empty());
    }

    #[tokio::test]
    async fn test_find_producer_skips_closed_and_foreign() {
        let engine = LoopbackEngine::new(EngineConfig::default());
        let session = PeerSession::new(PeerId::from("peer1"));
        let t = transport(&engine, Direction::Send, MediaKind::Video).await;
        let producer = t
            .produce(MediaKind::Video, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();
        let producer_id = producer.id().clone();
        session
            .install_producer(MediaKind::Video, ProducerSlot::new(Arc::clone(&producer)))
            .map_err(|(e, _)| e)
            .unwrap();

        let found = session.find_producer(&producer_id).unwrap();
        assert_eq!(found.producer.id(), &producer_id);
        assert!(session.find_producer(&ProducerId::from("other")).is_none());

        producer.close().unwrap();
        assert!(session.find_producer(&producer_id).is_none());
    }

    #[tokio::test]
    async fn test_remove_transport_matches_id() {
        let engine = LoopbackEngine::new(EngineConfig::default());
        let session = PeerSession::new(PeerId::from("peer1"));
        let t = transport(&engine, Direction::Recv, MediaKind::Audio).await;
        let transport_id = t.id().clone();
        session
            .install_transport(Direction::Recv, MediaKind::Audio, t)
            .map_err(|(e, _)| e)
            .unwrap();

        assert!(session
            .remove_transport(Direction::Recv, MediaKind::Audio, &TransportId::from("stale"))
            .is_none());
        assert!(session
            .remove_transport(Direction::Send, MediaKind::Audio, &transport_id)
            .is_none());
        let removed = session
            .remove_transport(Direction::Recv, MediaKind::Audio, &transport_id)
            .unwrap();
        assert_eq!(removed.transport.id(), &transport_id);
        assert!(!session.has_transport(Direction::Recv, MediaKind::Audio).unwrap());
    }

    #[test]
    fn test_announcement_ordering() {
        let announcement = Announcement::default();
        let mut log = Vec::new();

        assert!(announcement.publish(|| log.push("new")));
        assert!(!announcement.publish(|| log.push("new")));
        assert!(announcement.is_live());
        assert!(announcement.retire(|| log.push("closed")));
        assert!(!announcement.retire(|| log.push("closed")));
        assert_eq!(log, vec!["new", "closed"]);

        // retired before it was ever published: both stay silent
        let announcement = Announcement::default();
        assert!(announcement.retire(|| panic!("not published")));
        assert!(!announcement.publish(|| panic!("already retired")));
    }
}
