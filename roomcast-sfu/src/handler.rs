//! Signaling protocol handler
//!
//! Sequences media engine calls for each connection:
//! create transport → connect transport → produce / consume.
//! Out-of-order requests fail fast with a precondition error. Requests on
//! the same (direction, kind) pipeline are serialized; everything else may
//! run concurrently.

use crate::config::EngineConfig;
use crate::engine::{CloseReaction, CloseReason, MediaEngine, Transport, TransportOptions};
use crate::error::{EngineError, ErrorClass, Result, SfuError};
use crate::fanout::{EventReceiver, NotificationFanout, Scope};
use crate::peer::{Announcement, ConsumerSlot, JoinOutcome, PeerSession, ProducerSlot};
use crate::registry::RoomRegistry;
use crate::signaling::{
    response_payload, ClientRequest, ConsumerInfo, Envelope, Reply, ServerEvent, ServerMessage,
    TransportInfo,
};
use crate::types::{
    ConsumerId, Direction, DtlsParameters, MediaKind, PeerId, ProducerId, ProducerInfo, RoomId,
    RtpCapabilities, RtpParameters, TransportId,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

pub struct SignalingHandler {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<RoomRegistry>,
    fanout: Arc<NotificationFanout>,
    engine_config: EngineConfig,
}

impl SignalingHandler {
    #[must_use]
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        registry: Arc<RoomRegistry>,
        fanout: Arc<NotificationFanout>,
        engine_config: EngineConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            fanout,
            engine_config,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn fanout(&self) -> &Arc<NotificationFanout> {
        &self.fanout
    }

    fn rooms_enabled(&self) -> bool {
        self.registry.config().rooms_enabled
    }

    /// Open a session for a new connection and register its event channel
    pub fn connect(&self, peer_id: PeerId) -> (Arc<PeerSession>, EventReceiver) {
        let session = Arc::new(PeerSession::new(peer_id.clone()));
        let events = self.fanout.register(peer_id.clone());
        self.registry.register_session(Arc::clone(&session));

        info!(
            peer_id = %peer_id,
            rooms_enabled = self.rooms_enabled(),
            "Peer connected"
        );

        if !self.rooms_enabled() {
            let producers = self.registry.all_producers(Some(&peer_id));
            self.fanout
                .send_to(&peer_id, ServerEvent::ExistingProducers { producers });
        }

        (session, events)
    }

    /// Handle one decoded frame. Returns the response frame if the request
    /// carried a correlation id.
    pub async fn respond(&self, session: &Arc<PeerSession>, envelope: Envelope) -> Option<ServerMessage> {
        let Envelope { id, request } = envelope;
        let outcome = self.handle(session, request.clone()).await;
        let response = response_payload(&request, &outcome);
        id.map(|id| ServerMessage::Response {
            id: Some(id),
            response,
        })
    }

    /// Dispatch one request
    pub async fn handle(&self, session: &Arc<PeerSession>, request: ClientRequest) -> Result<Reply> {
        let message = request.name();
        debug!(peer_id = %session.id(), message, "Handling signaling message");

        let result = match request {
            ClientRequest::JoinRoom { room_id } => self.join_room(session, room_id),
            ClientRequest::GetRtpCapabilities => self.get_rtp_capabilities(session),
            ClientRequest::CreateProducerTransport { kind } => {
                self.create_transport(session, Direction::Send, kind).await
            }
            ClientRequest::ConnectProducerTransport {
                kind,
                dtls_parameters,
            } => {
                self.connect_transport(session, Direction::Send, kind, dtls_parameters)
                    .await
            }
            ClientRequest::StartProducing {
                kind,
                rtp_parameters,
            } => self.start_producing(session, kind, rtp_parameters).await,
            ClientRequest::CreateConsumerTransport { kind } => {
                self.create_transport(session, Direction::Recv, kind).await
            }
            ClientRequest::ConnectConsumerTransport {
                kind,
                dtls_parameters,
            } => {
                self.connect_transport(session, Direction::Recv, kind, dtls_parameters)
                    .await
            }
            ClientRequest::StartConsuming {
                producer_id,
                kind,
                remote_capabilities,
            } => {
                self.start_consuming(session, producer_id, kind, remote_capabilities)
                    .await
            }
            ClientRequest::ResumeConsuming { consumer_id } => {
                self.resume_consuming(session, &consumer_id).await
            }
            ClientRequest::PauseProducing { kind } => self.set_producing_paused(session, kind, true).await,
            ClientRequest::ResumeProducing { kind } => {
                self.set_producing_paused(session, kind, false).await
            }
            ClientRequest::CloseProducer { kind } => self.close_producer(session, kind).await,
        };

        if let Err(err) = &result {
            match err.class() {
                ErrorClass::Engine => {
                    error!(peer_id = %session.id(), message, error = %err, "Engine rejected request");
                }
                ErrorClass::NotReady => {
                    warn!(peer_id = %session.id(), message, "Media engine not ready");
                }
                ErrorClass::Precondition => {
                    debug!(peer_id = %session.id(), message, error = %err, "Request rejected");
                }
            }
        }
        result
    }

    /// Attach the session to a room, creating the room on first join
    pub fn join_room(&self, session: &Arc<PeerSession>, room_id: RoomId) -> Result<Reply> {
        if !self.rooms_enabled() {
            return Err(SfuError::RoomsDisabled);
        }
        if session.begin_join(&room_id)? == JoinOutcome::AlreadyMember {
            return Ok(Reply::Ok);
        }

        let peer_id = session.id().clone();
        if let Err(err) = self.registry.join(&room_id, Arc::clone(session)) {
            session.abort_join(&room_id);
            return Err(err);
        }
        // disconnect ran between begin_join and the registry insert
        if !session.is_open() {
            self.registry.leave(&peer_id);
            return Err(SfuError::SessionClosed);
        }

        info!(peer_id = %peer_id, room_id = %room_id, "Peer joined room");

        let producers = self.registry.producers_for_room(&room_id, Some(&peer_id));
        self.fanout
            .send_to(&peer_id, ServerEvent::ExistingProducers { producers });
        self.fanout.publish_in(
            &Scope::Room(room_id),
            Some(&peer_id),
            ServerEvent::PeerJoined { peer_id: peer_id.clone() },
        );
        Ok(Reply::Ok)
    }

    pub fn get_rtp_capabilities(&self, session: &PeerSession) -> Result<Reply> {
        session.ensure_ready(false)?;
        Ok(Reply::RtpCapabilities(self.engine.rtp_capabilities()))
    }

    /// Allocate the transport for one pipeline
    pub async fn create_transport(
        &self,
        session: &Arc<PeerSession>,
        direction: Direction,
        kind: MediaKind,
    ) -> Result<Reply> {
        session.ensure_ready(self.rooms_enabled())?;
        let _pipeline = session.lock_pipeline(direction, kind).await;

        if session.has_transport(direction, kind)? {
            return Err(SfuError::TransportExists { direction, kind });
        }

        let transport = self
            .engine
            .create_transport(TransportOptions {
                peer_id: session.id().clone(),
                direction,
                kind,
                engine: self.engine_config.clone(),
            })
            .await?;

        let info = TransportInfo {
            id: transport.id().clone(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        };

        if let Err((err, discarded)) =
            session.install_transport(direction, kind, Arc::clone(&transport))
        {
            close_transport(session.id(), &discarded);
            return Err(err);
        }
        transport.on_close(transport_close_reaction(session, direction, kind, info.id.clone()));

        info!(
            peer_id = %session.id(),
            transport_id = %info.id,
            direction = %direction,
            kind = %kind,
            "Transport created"
        );
        Ok(Reply::Transport(info))
    }

    /// Connect a pipeline transport. Repeated calls after success are no-ops.
    pub async fn connect_transport(
        &self,
        session: &Arc<PeerSession>,
        direction: Direction,
        kind: MediaKind,
        dtls_parameters: DtlsParameters,
    ) -> Result<Reply> {
        session.ensure_ready(self.rooms_enabled())?;
        let _pipeline = session.lock_pipeline(direction, kind).await;

        let slot = session.transport(direction, kind)?;
        if slot.connected {
            return Ok(Reply::Connected);
        }

        slot.transport.connect(dtls_parameters).await?;
        session.mark_connected(direction, kind)?;

        debug!(
            peer_id = %session.id(),
            transport_id = %slot.transport.id(),
            direction = %direction,
            kind = %kind,
            "Transport connected"
        );
        Ok(Reply::Connected)
    }

    /// Produce on the connected send transport, replacing any previous
    /// producer of the same kind
    pub async fn start_producing(
        &self,
        session: &Arc<PeerSession>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Reply> {
        session.ensure_ready(self.rooms_enabled())?;
        let _pipeline = session.lock_pipeline(Direction::Send, kind).await;

        let not_ready = SfuError::TransportNotReady {
            direction: Direction::Send,
            kind,
        };
        let transport = match session.transport(Direction::Send, kind) {
            Ok(slot) if slot.connected => slot.transport,
            Ok(_) | Err(SfuError::NoSuchTransport { .. }) => return Err(not_ready),
            Err(err) => return Err(err),
        };

        if let Some(previous) = session.take_producer(kind)? {
            debug!(
                peer_id = %session.id(),
                producer_id = %previous.producer.id(),
                kind = %kind,
                "Closing previous producer"
            );
            if let Err(err) = self.retire_producer(session.id(), &previous) {
                warn!(
                    peer_id = %session.id(),
                    producer_id = %previous.producer.id(),
                    error = %err,
                    "Failed to close previous producer"
                );
            }
        }

        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id().clone();
        let slot = ProducerSlot::new(Arc::clone(&producer));
        let announcement = Arc::clone(&slot.announcement);

        if let Err((err, slot)) = session.install_producer(kind, slot) {
            if let Err(close_err) = slot.producer.close() {
                warn!(producer_id = %producer_id, error = %close_err, "Failed to close discarded producer");
            }
            return Err(err);
        }

        let info = ProducerInfo {
            producer_id: producer_id.clone(),
            producer_socket_id: session.id().clone(),
            kind,
        };
        announcement.publish(|| {
            self.fanout.publish(session.id(), ServerEvent::NewProducer(info));
        });

        // registered after the announcement so a close that already happened
        // is reported after new-producer
        producer.on_close(self.producer_close_reaction(session, kind, &producer_id, announcement));

        info!(
            peer_id = %session.id(),
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(Reply::Produced { id: producer_id })
    }

    /// Consume a producer visible in the caller's scope. Consumers start paused.
    pub async fn start_consuming(
        &self,
        session: &Arc<PeerSession>,
        producer_id: ProducerId,
        kind: MediaKind,
        remote_capabilities: RtpCapabilities,
    ) -> Result<Reply> {
        session.ensure_ready(self.rooms_enabled())?;
        let _pipeline = session.lock_pipeline(Direction::Recv, kind).await;

        let transport = session.transport(Direction::Recv, kind)?.transport;
        if !self.producer_visible(session, &producer_id, kind) {
            return Err(SfuError::NoSuchProducer(producer_id));
        }

        let consumer = transport
            .consume(&producer_id, remote_capabilities, true)
            .await?;
        let info = ConsumerInfo {
            id: consumer.id().clone(),
            producer_id: consumer.producer_id().clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };

        if let Err((err, slot)) = session.install_consumer(ConsumerSlot::new(Arc::clone(&consumer))) {
            if let Err(close_err) = slot.consumer.close() {
                warn!(consumer_id = %info.id, error = %close_err, "Failed to close discarded consumer");
            }
            return Err(err);
        }
        consumer.on_close(consumer_close_reaction(session, info.id.clone()));

        info!(
            peer_id = %session.id(),
            consumer_id = %info.id,
            producer_id = %info.producer_id,
            kind = %kind,
            "Consumer created"
        );
        Ok(Reply::Consumer(info))
    }

    /// Resume a paused consumer. The engine is asked once per transition.
    pub async fn resume_consuming(&self, session: &Arc<PeerSession>, consumer_id: &ConsumerId) -> Result<Reply> {
        session.ensure_ready(self.rooms_enabled())?;
        let slot = session.consumer(consumer_id)?;

        if !slot.paused.swap(false, Ordering::SeqCst) {
            debug!(peer_id = %session.id(), consumer_id = %consumer_id, "Consumer already resumed");
            return Ok(Reply::Ok);
        }
        if let Err(err) = slot.consumer.resume().await {
            slot.paused.store(true, Ordering::SeqCst);
            return Err(err.into());
        }

        debug!(peer_id = %session.id(), consumer_id = %consumer_id, "Consumer resumed");
        Ok(Reply::Ok)
    }

    /// Pause or resume the producer of `kind`, notifying the scope on change
    pub async fn set_producing_paused(
        &self,
        session: &Arc<PeerSession>,
        kind: MediaKind,
        paused: bool,
    ) -> Result<Reply> {
        session.ensure_ready(self.rooms_enabled())?;
        let _pipeline = session.lock_pipeline(Direction::Send, kind).await;

        let slot = session.producer(kind)?;
        if slot.paused == paused {
            return Ok(Reply::Ok);
        }
        if paused {
            slot.producer.pause().await?;
        } else {
            slot.producer.resume().await?;
        }
        session.set_producer_paused(kind, paused)?;

        info!(
            peer_id = %session.id(),
            producer_id = %slot.producer.id(),
            kind = %kind,
            paused,
            "Producer state changed"
        );
        self.fanout.publish(
            session.id(),
            ServerEvent::PeerProducerStateChanged {
                producer_socket_id: session.id().clone(),
                kind,
                paused,
            },
        );
        Ok(Reply::Ok)
    }

    /// Close the producer of `kind` on request
    pub async fn close_producer(&self, session: &Arc<PeerSession>, kind: MediaKind) -> Result<Reply> {
        session.ensure_ready(self.rooms_enabled())?;
        let _pipeline = session.lock_pipeline(Direction::Send, kind).await;

        let slot = session
            .take_producer(kind)?
            .ok_or(SfuError::NoProducerOfKind(kind))?;
        self.retire_producer(session.id(), &slot)?;

        info!(
            peer_id = %session.id(),
            producer_id = %slot.producer.id(),
            kind = %kind,
            "Producer closed"
        );
        Ok(Reply::Ok)
    }

    /// Tear the session down. Safe to call more than once.
    pub fn disconnect(&self, session: &Arc<PeerSession>) {
        let peer_id = session.id().clone();
        let Some(teardown) = session.close() else {
            debug!(peer_id = %peer_id, "Session already torn down");
            return;
        };

        let producer_count = teardown.producers.len();
        let consumer_count = teardown.consumers.len();
        let transport_count = teardown.send_transports.len() + teardown.recv_transports.len();

        // producers first: their announcements still resolve the room scope
        for (_, slot) in &teardown.producers {
            if let Err(err) = self.retire_producer(&peer_id, slot) {
                warn!(
                    peer_id = %peer_id,
                    producer_id = %slot.producer.id(),
                    error = %err,
                    "Failed to close producer during teardown"
                );
            }
        }
        for slot in &teardown.consumers {
            if let Err(err) = slot.consumer.close() {
                warn!(
                    peer_id = %peer_id,
                    consumer_id = %slot.consumer.id(),
                    error = %err,
                    "Failed to close consumer during teardown"
                );
            }
        }
        for (_, slot) in teardown.send_transports.iter().chain(&teardown.recv_transports) {
            close_transport(&peer_id, &slot.transport);
        }

        let scope = match teardown.room_id {
            Some(room_id) => {
                if let Some(departure) = self.registry.leave(&peer_id) {
                    debug!(
                        peer_id = %peer_id,
                        room_id = %departure.room_id,
                        room_removed = departure.room_removed,
                        "Peer left room"
                    );
                }
                Some(Scope::Room(room_id))
            }
            None if !self.rooms_enabled() => Some(Scope::Global),
            None => None,
        };
        if let Some(scope) = scope {
            self.fanout.publish_in(
                &scope,
                Some(&peer_id),
                ServerEvent::PeerLeft {
                    peer_id: peer_id.clone(),
                },
            );
        }

        self.fanout.unregister(&peer_id);
        self.registry.remove_session(&peer_id);

        info!(
            peer_id = %peer_id,
            producers = producer_count,
            consumers = consumer_count,
            transports = transport_count,
            "Peer disconnected"
        );
    }

    /// Whether a live producer of `kind` is visible from the caller's scope
    fn producer_visible(&self, session: &PeerSession, producer_id: &ProducerId, kind: MediaKind) -> bool {
        let candidates = if self.rooms_enabled() {
            self.registry
                .room_of(session.id())
                .and_then(|room_id| self.registry.room(&room_id))
                .map(|room| room.peers())
                .unwrap_or_default()
        } else {
            self.registry.sessions()
        };
        candidates
            .iter()
            .filter_map(|peer| peer.find_producer(producer_id))
            .any(|slot| slot.producer.kind() == kind)
    }

    /// Close a producer that has already left its slot and make sure its
    /// departure is announced exactly once
    fn retire_producer(&self, owner: &PeerId, slot: &ProducerSlot) -> std::result::Result<(), EngineError> {
        let result = slot.producer.close();
        // normally done by the close reaction; covers failed closes and
        // producers whose reaction was never registered
        announce_producer_closed(&self.fanout, owner, slot.producer.id(), &slot.announcement);
        result
    }

    fn producer_close_reaction(
        &self,
        session: &Arc<PeerSession>,
        kind: MediaKind,
        producer_id: &ProducerId,
        announcement: Arc<Announcement>,
    ) -> CloseReaction {
        let owner = Arc::downgrade(session);
        let owner_id = session.id().clone();
        let producer_id = producer_id.clone();
        let fanout = Arc::clone(&self.fanout);
        Box::new(move |reason: CloseReason| {
            if let Some(owner) = owner.upgrade() {
                owner.remove_producer(kind, &producer_id);
            }
            debug!(
                peer_id = %owner_id,
                producer_id = %producer_id,
                reason = ?reason,
                "Producer closed by engine"
            );
            announce_producer_closed(&fanout, &owner_id, &producer_id, &announcement);
        })
    }
}

fn announce_producer_closed(
    fanout: &NotificationFanout,
    owner: &PeerId,
    producer_id: &ProducerId,
    announcement: &Announcement,
) {
    announcement.retire(|| {
        fanout.publish(
            owner,
            ServerEvent::ProducerClosed {
                producer_id: producer_id.clone(),
                producer_socket_id: Some(owner.clone()),
            },
        );
    });
}

fn consumer_close_reaction(session: &Arc<PeerSession>, consumer_id: ConsumerId) -> CloseReaction {
    let owner: Weak<PeerSession> = Arc::downgrade(session);
    Box::new(move |reason: CloseReason| {
        let Some(owner) = owner.upgrade() else {
            return;
        };
        if owner.remove_consumer(&consumer_id).is_some() {
            debug!(
                peer_id = %owner.id(),
                consumer_id = %consumer_id,
                reason = ?reason,
                "Consumer removed after close"
            );
        }
    })
}

fn transport_close_reaction(
    session: &Arc<PeerSession>,
    direction: Direction,
    kind: MediaKind,
    transport_id: TransportId,
) -> CloseReaction {
    let owner: Weak<PeerSession> = Arc::downgrade(session);
    Box::new(move |reason: CloseReason| {
        let Some(owner) = owner.upgrade() else {
            return;
        };
        if owner.remove_transport(direction, kind, &transport_id).is_some() {
            info!(
                peer_id = %owner.id(),
                transport_id = %transport_id,
                direction = %direction,
                kind = %kind,
                reason = ?reason,
                "Transport removed after close"
            );
        }
    })
}

fn close_transport(peer_id: &PeerId, transport: &Arc<dyn Transport>) {
    if let Err(err) = transport.close() {
        warn!(
            peer_id = %peer_id,
            transport_id = %transport.id(),
            error = %err,
            "Failed to close transport"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::loopback::{EngineOp, LoopbackEngine};
    use serde_json::json;

    struct Harness {
        engine: LoopbackEngine,
        handler: SignalingHandler,
    }

    fn harness(rooms_enabled: bool) -> Harness {
        let engine = LoopbackEngine::new(EngineConfig::default());
        let registry = Arc::new(RoomRegistry::new(Arc::new(SfuConfig {
            rooms_enabled,
            ..SfuConfig::default()
        })));
        let fanout = Arc::new(NotificationFanout::new(Arc::clone(&registry)));
        let handler = SignalingHandler::new(
            Arc::new(engine.clone()),
            registry,
            fanout,
            EngineConfig::default(),
        );
        Harness { engine, handler }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters(json!({ "role": "client", "fingerprints": [] }))
    }

    async fn producing(handler: &SignalingHandler, session: &Arc<PeerSession>, kind: MediaKind) -> ProducerId {
        handler.create_transport(session, Direction::Send, kind).await.unwrap();
        handler
            .connect_transport(session, Direction::Send, kind, dtls())
            .await
            .unwrap();
        match handler
            .start_producing(session, kind, RtpParameters(json!({ "codecs": [] })))
            .await
            .unwrap()
        {
            Reply::Produced { id } => id,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_media_ops_require_join_in_room_mode() {
        let h = harness(true);
        let (session, _events) = h.handler.connect(PeerId::from("a"));

        let result = h.handler.create_transport(&session, Direction::Send, MediaKind::Audio).await;
        assert_eq!(result, Err(SfuError::NotJoined));
        assert!(h.handler.get_rtp_capabilities(&session).is_ok());
    }

    #[tokio::test]
    async fn test_join_room_rejected_when_rooms_disabled() {
        let h = harness(false);
        let (session, mut events) = h.handler.connect(PeerId::from("a"));

        assert_eq!(
            events.recv().await.unwrap(),
            ServerEvent::ExistingProducers { producers: vec![] }
        );
        assert_eq!(
            h.handler.join_room(&session, RoomId::from("r1")),
            Err(SfuError::RoomsDisabled)
        );
    }

    #[tokio::test]
    async fn test_transport_exists_and_connect_idempotent() {
        let h = harness(false);
        let (session, _events) = h.handler.connect(PeerId::from("a"));

        h.handler
            .create_transport(&session, Direction::Recv, MediaKind::Video)
            .await
            .unwrap();
        let again = h
            .handler
            .create_transport(&session, Direction::Recv, MediaKind::Video)
            .await;
        assert_eq!(
            again,
            Err(SfuError::TransportExists {
                direction: Direction::Recv,
                kind: MediaKind::Video
            })
        );

        for _ in 0..2 {
            let reply = h
                .handler
                .connect_transport(&session, Direction::Recv, MediaKind::Video, dtls())
                .await;
            assert_eq!(reply, Ok(Reply::Connected));
        }
        assert_eq!(h.engine.calls().connects, 1);
    }

    #[tokio::test]
    async fn test_replacing_producer_announces_old_one() {
        let h = harness(false);
        let (a, _a_events) = h.handler.connect(PeerId::from("a"));
        let (_b, mut b_events) = h.handler.connect(PeerId::from("b"));
        // drain b's initial snapshot
        b_events.recv().await.unwrap();

        let first = producing(&h.handler, &a, MediaKind::Audio).await;
        let second = match h
            .handler
            .start_producing(&a, MediaKind::Audio, RtpParameters(json!({})))
            .await
            .unwrap()
        {
            Reply::Produced { id } => id,
            other => panic!("unexpected reply {other:?}"),
        };

        assert!(matches!(b_events.recv().await.unwrap(), ServerEvent::NewProducer(info) if info.producer_id == first));
        assert_eq!(
            b_events.recv().await.unwrap(),
            ServerEvent::ProducerClosed {
                producer_id: first,
                producer_socket_id: Some(PeerId::from("a")),
            }
        );
        assert!(matches!(b_events.recv().await.unwrap(), ServerEvent::NewProducer(info) if info.producer_id == second));
        assert_eq!(h.engine.live_producers(), 1);
    }

    #[tokio::test]
    async fn test_engine_closed_transport_frees_its_pipeline() {
        let h = harness(false);
        let (a, _a_events) = h.handler.connect(PeerId::from("a"));
        let (_b, mut b_events) = h.handler.connect(PeerId::from("b"));
        b_events.recv().await.unwrap();

        let first = producing(&h.handler, &a, MediaKind::Video).await;
        b_events.recv().await.unwrap();
        let transport_id = a
            .transport(Direction::Send, MediaKind::Video)
            .unwrap()
            .transport
            .id()
            .clone();

        assert!(h.engine.close_transport(&transport_id));
        assert_eq!(a.transport_count(), 0);
        assert_eq!(a.producer_count(), 0);
        assert_eq!(
            b_events.recv().await.unwrap(),
            ServerEvent::ProducerClosed {
                producer_id: first.clone(),
                producer_socket_id: Some(PeerId::from("a")),
            }
        );

        // the pipeline is usable again
        let second = producing(&h.handler, &a, MediaKind::Video).await;
        assert_ne!(first, second);
        assert_eq!(a.producer_count(), 1);
        assert_eq!(h.engine.live_transports(), 1);
        assert!(matches!(b_events.recv().await.unwrap(), ServerEvent::NewProducer(info) if info.producer_id == second));
    }

    #[tokio::test]
    async fn test_pause_resume_producing_broadcasts_changes() {
        let h = harness(false);
        let (a, _a_events) = h.handler.connect(PeerId::from("a"));
        let (_b, mut b_events) = h.handler.connect(PeerId::from("b"));
        b_events.recv().await.unwrap();
        producing(&h.handler, &a, MediaKind::Video).await;
        b_events.recv().await.unwrap();

        h.handler.set_producing_paused(&a, MediaKind::Video, true).await.unwrap();
        // no change, no engine call
        h.handler.set_producing_paused(&a, MediaKind::Video, true).await.unwrap();
        h.handler.set_producing_paused(&a, MediaKind::Video, false).await.unwrap();

        let calls = h.engine.calls();
        assert_eq!(calls.producer_pauses, 1);
        assert_eq!(calls.producer_resumes, 1);

        for paused in [true, false] {
            assert_eq!(
                b_events.recv().await.unwrap(),
                ServerEvent::PeerProducerStateChanged {
                    producer_socket_id: PeerId::from("a"),
                    kind: MediaKind::Video,
                    paused,
                }
            );
        }

        let missing = h.handler.set_producing_paused(&a, MediaKind::Audio, true).await;
        assert_eq!(missing.unwrap_err().code(), "no_such_producer");
    }

    #[tokio::test]
    async fn test_consume_requires_transport_and_visible_producer() {
        let h = harness(true);
        let (a, _a_events) = h.handler.connect(PeerId::from("a"));
        let (b, _b_events) = h.handler.connect(PeerId::from("b"));
        let (c, _c_events) = h.handler.connect(PeerId::from("c"));
        h.handler.join_room(&a, RoomId::from("r1")).unwrap();
        h.handler.join_room(&b, RoomId::from("r1")).unwrap();
        h.handler.join_room(&c, RoomId::from("r2")).unwrap();

        let producer_id = producing(&h.handler, &a, MediaKind::Audio).await;
        let caps = RtpCapabilities(json!({ "codecs": [] }));

        let no_transport = h
            .handler
            .start_consuming(&b, producer_id.clone(), MediaKind::Audio, caps.clone())
            .await;
        assert_eq!(
            no_transport,
            Err(SfuError::NoSuchTransport {
                direction: Direction::Recv,
                kind: MediaKind::Audio
            })
        );

        // other room cannot see it
        h.handler.create_transport(&c, Direction::Recv, MediaKind::Audio).await.unwrap();
        let hidden = h
            .handler
            .start_consuming(&c, producer_id.clone(), MediaKind::Audio, caps.clone())
            .await;
        assert_eq!(hidden, Err(SfuError::NoSuchProducer(producer_id.clone())));

        h.handler.create_transport(&b, Direction::Recv, MediaKind::Audio).await.unwrap();
        let reply = h
            .handler
            .start_consuming(&b, producer_id.clone(), MediaKind::Audio, caps)
            .await
            .unwrap();
        let Reply::Consumer(info) = reply else {
            panic!("expected consumer reply");
        };
        assert_eq!(info.producer_id, producer_id);
        assert_eq!(b.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_engine_errors_keep_session_alive() {
        let h = harness(false);
        let (session, _events) = h.handler.connect(PeerId::from("a"));

        h.engine.fail_next(EngineOp::CreateTransport);
        let failed = h
            .handler
            .create_transport(&session, Direction::Send, MediaKind::Video)
            .await
            .unwrap_err();
        assert_eq!(failed.class(), ErrorClass::Engine);

        // nothing stored, retry works
        assert_eq!(session.transport_count(), 0);
        h.handler
            .create_transport(&session, Direction::Send, MediaKind::Video)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_producer_request() {
        let h = harness(false);
        let (a, _a_events) = h.handler.connect(PeerId::from("a"));
        producing(&h.handler, &a, MediaKind::Video).await;

        assert_eq!(h.handler.close_producer(&a, MediaKind::Video).await, Ok(Reply::Ok));
        assert_eq!(a.producer_count(), 0);
        assert_eq!(h.engine.live_producers(), 0);
        assert_eq!(
            h.handler.close_producer(&a, MediaKind::Video).await,
            Err(SfuError::NoProducerOfKind(MediaKind::Video))
        );
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_noop() {
        let h = harness(true);
        let (a, _events) = h.handler.connect(PeerId::from("a"));
        h.handler.join_room(&a, RoomId::from("r1")).unwrap();
        producing(&h.handler, &a, MediaKind::Audio).await;

        h.handler.disconnect(&a);
        h.handler.disconnect(&a);

        assert_eq!(h.engine.live_transports(), 0);
        assert_eq!(h.engine.live_producers(), 0);
        assert_eq!(h.handler.registry().room_count(), 0);
        assert!(!h.handler.fanout().is_registered(&PeerId::from("a")));
        assert_eq!(
            h.handler.handle(&a, ClientRequest::GetRtpCapabilities).await,
            Err(SfuError::SessionClosed)
        );
    }
}
