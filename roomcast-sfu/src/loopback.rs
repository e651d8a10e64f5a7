//! In-process media engine
//!
//! Implements the [`MediaEngine`] facade at the bookkeeping level: it hands
//! out identifiers and transport parameters, tracks which resources are
//! alive and honours the close-propagation contract, but never moves media.
//! Used by the development server and by every test. It also supports
//! readiness toggling, artificial latency and one-shot fault injection.

use crate::config::EngineConfig;
use crate::engine::{
    CloseReaction, CloseReason, Consumer, MediaEngine, Producer, Transport, TransportOptions,
};
use crate::error::EngineError;
use crate::types::{
    ConsumerId, Direction, DtlsParameters, IceCandidates, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, TransportId,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Engine operation that can be targeted by [`LoopbackEngine::fail_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateTransport,
    Connect,
    Produce,
    Consume,
    Pause,
    Resume,
    Close,
}

/// Snapshot of engine call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub transports_created: u64,
    pub connects: u64,
    pub produces: u64,
    pub consumes: u64,
    pub producer_pauses: u64,
    pub producer_resumes: u64,
    pub consumer_resumes: u64,
}

#[derive(Default)]
struct Counters {
    transports_created: AtomicU64,
    connects: AtomicU64,
    produces: AtomicU64,
    consumes: AtomicU64,
    producer_pauses: AtomicU64,
    producer_resumes: AtomicU64,
    consumer_resumes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Close state plus pending reactions of one resource
#[derive(Default)]
struct Lifecycle {
    state: Mutex<LifecycleState>,
}

#[derive(Default)]
struct LifecycleState {
    closed: Option<CloseReason>,
    reactions: Vec<CloseReaction>,
}

impl Lifecycle {
    fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    fn subscribe(&self, reaction: CloseReaction) {
        let mut state = self.state.lock();
        if let Some(reason) = state.closed {
            drop(state);
            reaction(reason);
        } else {
            state.reactions.push(reaction);
        }
    }

    /// Marks the resource closed and runs its reactions. Returns false if it
    /// was already closed.
    fn close(&self, reason: CloseReason) -> bool {
        let reactions = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason);
            std::mem::take(&mut state.reactions)
        };
        for reaction in reactions {
            reaction(reason);
        }
        true
    }
}

struct EngineState {
    config: EngineConfig,
    ready: AtomicBool,
    latency: Mutex<Option<Duration>>,
    next_port: AtomicU32,
    transports: DashMap<TransportId, Arc<LoopbackTransport>>,
    producers: DashMap<ProducerId, Arc<LoopbackProducer>>,
    consumers: DashMap<ConsumerId, Arc<LoopbackConsumer>>,
    faults: Mutex<Vec<EngineOp>>,
    counters: Counters,
}

impl EngineState {
    fn check_fault(&self, op: EngineOp) -> Result<(), EngineError> {
        let mut faults = self.faults.lock();
        if let Some(pos) = faults.iter().position(|f| *f == op) {
            faults.remove(pos);
            return Err(EngineError::Rejected(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
    }

    fn transport(&self, id: &TransportId) -> Option<Arc<LoopbackTransport>> {
        self.transports.get(id).map(|t| Arc::clone(t.value()))
    }

    fn producer(&self, id: &ProducerId) -> Option<Arc<LoopbackProducer>> {
        self.producers.get(id).map(|p| Arc::clone(p.value()))
    }

    fn allocate_port(&self) -> u16 {
        let count = self.config.port_count().max(1);
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % count;
        u16::try_from(u32::from(self.config.rtc_min_port) + offset)
            .unwrap_or(self.config.rtc_min_port)
    }
}

/// Default router capabilities: Opus audio and VP8 video
fn router_capabilities() -> RtpCapabilities {
    RtpCapabilities(json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000,
                "parameters": { "x-google-start-bitrate": 1000 }
            }
        ],
        "headerExtensions": []
    }))
}

/// Bookkeeping-only engine
#[derive(Clone)]
pub struct LoopbackEngine {
    state: Arc<EngineState>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        debug!(
            listen_ip = %config.listen_ip,
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            "Loopback media engine initialized"
        );
        Self {
            state: Arc::new(EngineState {
                config,
                ready: AtomicBool::new(true),
                latency: Mutex::new(None),
                next_port: AtomicU32::new(0),
                transports: DashMap::new(),
                producers: DashMap::new(),
                consumers: DashMap::new(),
                faults: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Toggle router readiness
    pub fn set_ready(&self, ready: bool) {
        self.state.ready.store(ready, Ordering::SeqCst);
    }

    /// Delay every async engine call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.state.latency.lock() = latency;
    }

    /// Make the next call of `op` fail with [`EngineError::Rejected`]
    pub fn fail_next(&self, op: EngineOp) {
        self.state.faults.lock().push(op);
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        let c = &self.state.counters;
        CallCounts {
            transports_created: c.transports_created.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
            produces: c.produces.load(Ordering::Relaxed),
            consumes: c.consumes.load(Ordering::Relaxed),
            producer_pauses: c.producer_pauses.load(Ordering::Relaxed),
            producer_resumes: c.producer_resumes.load(Ordering::Relaxed),
            consumer_resumes: c.consumer_resumes.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn live_transports(&self) -> usize {
        self.state.transports.len()
    }

    #[must_use]
    pub fn live_producers(&self) -> usize {
        self.state.producers.len()
    }

    #[must_use]
    pub fn live_consumers(&self) -> usize {
        self.state.consumers.len()
    }

    /// Close a producer from the engine side, as if its source went away
    pub fn close_producer(&self, id: &ProducerId) -> bool {
        self.state
            .producer(id)
            .is_some_and(|p| p.shutdown(CloseReason::Explicit))
    }

    /// Close a transport from the engine side (e.g. ICE failure)
    pub fn close_transport(&self, id: &TransportId) -> bool {
        self.state
            .transport(id)
            .is_some_and(|t| t.shutdown(CloseReason::Explicit))
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.state
            .ready
            .load(Ordering::SeqCst)
            .then(router_capabilities)
    }

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        self.state.simulate_latency().await;
        if !self.state.ready.load(Ordering::SeqCst) {
            return Err(EngineError::NotReady);
        }
        self.state.check_fault(EngineOp::CreateTransport)?;

        let id = TransportId::generate();
        let port = self.state.allocate_port();
        let candidate_ip = options.engine.candidate_ip().to_string();
        let fingerprint = uuid::Uuid::new_v4().simple().to_string();

        let transport = Arc::new(LoopbackTransport {
            id: id.clone(),
            direction: options.direction,
            ice: IceParameters(json!({
                "usernameFragment": nanoid::nanoid!(16),
                "password": nanoid::nanoid!(32),
                "iceLite": true
            })),
            candidates: IceCandidates(json!([{
                "foundation": "udpcandidate",
                "priority": 1_076_302_079_u32,
                "ip": candidate_ip,
                "protocol": "udp",
                "port": port,
                "type": "host"
            }])),
            dtls: DtlsParameters(json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint }]
            })),
            connected: AtomicBool::new(false),
            lifecycle: Lifecycle::default(),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            engine: Arc::downgrade(&self.state),
        });

        self.state.transports.insert(id.clone(), Arc::clone(&transport));
        bump(&self.state.counters.transports_created);
        trace!(
            transport_id = %id,
            peer_id = %options.peer_id,
            direction = ?options.direction,
            kind = %options.kind,
            port,
            "Transport created"
        );

        Ok(transport)
    }
}

struct LoopbackTransport {
    id: TransportId,
    direction: Direction,
    ice: IceParameters,
    candidates: IceCandidates,
    dtls: DtlsParameters,
    connected: AtomicBool,
    lifecycle: Lifecycle,
    producers: Mutex<HashMap<ProducerId, Arc<LoopbackProducer>>>,
    consumers: Mutex<HashMap<ConsumerId, Arc<LoopbackConsumer>>>,
    engine: Weak<EngineState>,
}

impl LoopbackTransport {
    fn engine(&self) -> Result<Arc<EngineState>, EngineError> {
        self.engine.upgrade().ok_or(EngineError::Closed)
    }

    fn shutdown(&self, reason: CloseReason) -> bool {
        if !self.lifecycle.close(reason) {
            return false;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.transports.remove(&self.id);
        }
        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers.into_values() {
            producer.shutdown(CloseReason::TransportClosed);
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.into_values() {
            consumer.shutdown(CloseReason::TransportClosed);
        }
        trace!(transport_id = %self.id, ?reason, "Transport closed");
        true
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice.clone()
    }

    fn ice_candidates(&self) -> IceCandidates {
        self.candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        let engine = self.engine()?;
        engine.simulate_latency().await;
        engine.check_fault(EngineOp::Connect)?;
        if self.lifecycle.is_closed() {
            return Err(EngineError::Closed);
        }
        if !dtls_parameters.0.is_object() {
            return Err(EngineError::Rejected("invalid dtlsParameters".to_string()));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Rejected("connect() already called".to_string()));
        }
        bump(&engine.counters.connects);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError> {
        let engine = self.engine()?;
        engine.simulate_latency().await;
        engine.check_fault(EngineOp::Produce)?;
        if self.lifecycle.is_closed() {
            return Err(EngineError::Closed);
        }
        if self.direction != Direction::Send {
            return Err(EngineError::Rejected("not a sending transport".to_string()));
        }
        if !rtp_parameters.0.is_object() {
            return Err(EngineError::Rejected("invalid rtpParameters".to_string()));
        }

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::generate(),
            transport_id: self.id.clone(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(false),
            lifecycle: Lifecycle::default(),
            consumers: Mutex::new(HashMap::new()),
            engine: Arc::downgrade(&engine),
        });
        self.producers
            .lock()
            .insert(producer.id.clone(), Arc::clone(&producer));
        engine.producers.insert(producer.id.clone(), Arc::clone(&producer));
        bump(&engine.counters.produces);

        // transport may have closed while we were building the producer
        if self.lifecycle.is_closed() {
            self.producers.lock().remove(&producer.id);
            producer.shutdown(CloseReason::TransportClosed);
        }
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError> {
        let engine = self.engine()?;
        engine.simulate_latency().await;
        engine.check_fault(EngineOp::Consume)?;
        if self.lifecycle.is_closed() {
            return Err(EngineError::Closed);
        }
        if self.direction != Direction::Recv {
            return Err(EngineError::Rejected("not a receiving transport".to_string()));
        }
        if !rtp_capabilities.0.is_object() {
            return Err(EngineError::Rejected("cannot consume with given capabilities".to_string()));
        }
        let producer = engine
            .producer(producer_id)
            .ok_or_else(|| EngineError::Rejected(format!("producer {producer_id} not found")))?;

        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::generate(),
            producer_id: producer.id.clone(),
            transport_id: self.id.clone(),
            kind: producer.kind,
            rtp_parameters: RtpParameters(json!({
                "producerRtp": producer.rtp_parameters.0.clone(),
                "ssrc": u32::try_from(uuid::Uuid::new_v4().as_u128() >> 96).unwrap_or(1),
            })),
            paused: AtomicBool::new(paused),
            lifecycle: Lifecycle::default(),
            engine: Arc::downgrade(&engine),
        });
        producer
            .consumers
            .lock()
            .insert(consumer.id.clone(), Arc::downgrade(&consumer));
        self.consumers
            .lock()
            .insert(consumer.id.clone(), Arc::clone(&consumer));
        engine.consumers.insert(consumer.id.clone(), Arc::clone(&consumer));
        bump(&engine.counters.consumes);

        // either side may have closed while we were building the consumer
        if producer.lifecycle.is_closed() {
            producer.consumers.lock().remove(&consumer.id);
            self.consumers.lock().remove(&consumer.id);
            consumer.shutdown(CloseReason::ProducerClosed);
        } else if self.lifecycle.is_closed() {
            producer.consumers.lock().remove(&consumer.id);
            self.consumers.lock().remove(&consumer.id);
            consumer.shutdown(CloseReason::TransportClosed);
        }
        Ok(consumer)
    }

    fn close(&self) -> Result<(), EngineError> {
        self.engine()?.check_fault(EngineOp::Close)?;
        self.shutdown(CloseReason::Explicit);
        Ok(())
    }

    fn on_close(&self, reaction: CloseReaction) {
        self.lifecycle.subscribe(reaction);
    }
}

struct LoopbackProducer {
    id: ProducerId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    lifecycle: Lifecycle,
    consumers: Mutex<HashMap<ConsumerId, Weak<LoopbackConsumer>>>,
    engine: Weak<EngineState>,
}

impl LoopbackProducer {
    fn engine(&self) -> Result<Arc<EngineState>, EngineError> {
        self.engine.upgrade().ok_or(EngineError::Closed)
    }

    fn shutdown(&self, reason: CloseReason) -> bool {
        if !self.lifecycle.close(reason) {
            return false;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.producers.remove(&self.id);
            if let Some(transport) = engine.transport(&self.transport_id) {
                transport.producers.lock().remove(&self.id);
            }
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.values().filter_map(Weak::upgrade) {
            consumer.shutdown(CloseReason::ProducerClosed);
        }
        trace!(producer_id = %self.id, ?reason, "Producer closed");
        true
    }
}

#[async_trait]
impl Producer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    async fn pause(&self) -> Result<(), EngineError> {
        let engine = self.engine()?;
        engine.simulate_latency().await;
        engine.check_fault(EngineOp::Pause)?;
        if self.lifecycle.is_closed() {
            return Err(EngineError::Closed);
        }
        self.paused.store(true, Ordering::SeqCst);
        bump(&engine.counters.producer_pauses);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let engine = self.engine()?;
        engine.simulate_latency().await;
        engine.check_fault(EngineOp::Resume)?;
        if self.lifecycle.is_closed() {
            return Err(EngineError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        bump(&engine.counters.producer_resumes);
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        self.engine()?.check_fault(EngineOp::Close)?;
        self.shutdown(CloseReason::Explicit);
        Ok(())
    }

    fn on_close(&self, reaction: CloseReaction) {
        self.lifecycle.subscribe(reaction);
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    lifecycle: Lifecycle,
    engine: Weak<EngineState>,
}

impl LoopbackConsumer {
    fn shutdown(&self, reason: CloseReason) -> bool {
        if !self.lifecycle.close(reason) {
            return false;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.consumers.remove(&self.id);
            if let Some(transport) = engine.transport(&self.transport_id) {
                transport.consumers.lock().remove(&self.id);
            }
            if let Some(producer) = engine.producer(&self.producer_id) {
                producer.consumers.lock().remove(&self.id);
            }
        }
        trace!(consumer_id = %self.id, ?reason, "Consumer closed");
        true
    }
}

#[async_trait]
impl Consumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let engine = self.engine.upgrade().ok_or(EngineError::Closed)?;
        engine.simulate_latency().await;
        engine.check_fault(EngineOp::Resume)?;
        if self.lifecycle.is_closed() {
            return Err(EngineError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        bump(&engine.counters.consumer_resumes);
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        if let Some(engine) = self.engine.upgrade() {
            engine.check_fault(EngineOp::Close)?;
        }
        self.shutdown(CloseReason::Explicit);
        Ok(())
    }

    fn on_close(&self, reaction: CloseReaction) {
        self.lifecycle.subscribe(reaction);
    }
}
