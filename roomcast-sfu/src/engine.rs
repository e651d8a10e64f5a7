//! Media engine facade
//!
//! The signaling core never touches RTP, ICE or DTLS itself. It drives an
//! engine through these traits and reacts to resource closure through
//! explicit [`CloseReaction`] subscriptions registered at creation time.
//!
//! Contract for implementations:
//! - `close()` is idempotent; closing an already closed resource is `Ok`.
//! - Closing a transport closes every producer and consumer created on it
//!   (reason [`CloseReason::TransportClosed`]).
//! - Closing a producer closes every consumer built against it
//!   (reason [`CloseReason::ProducerClosed`]) but never the reverse.
//! - Reactions run synchronously on the closing call, at most once, and are
//!   invoked immediately if registered on a resource that is already closed.
//!   Implementations must not hold internal locks while running them.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::types::{
    ConsumerId, Direction, DtlsParameters, IceCandidates, IceParameters, MediaKind, PeerId,
    ProducerId, RtpCapabilities, RtpParameters, TransportId,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Why an engine resource closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on the resource itself
    Explicit,
    /// The transport carrying the resource closed
    TransportClosed,
    /// The source producer of a consumer closed
    ProducerClosed,
}

/// Typed close subscription
pub type CloseReaction = Box<dyn FnOnce(CloseReason) + Send + 'static>;

/// Parameters for a transport allocation
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub peer_id: PeerId,
    pub direction: Direction,
    pub kind: MediaKind,
    pub engine: EngineConfig,
}

/// Entry point of the engine: one router per deployment
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Router RTP capabilities, `None` while the router is not initialised
    fn rtp_capabilities(&self) -> Option<RtpCapabilities>;

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &TransportId;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> IceCandidates;
    fn dtls_parameters(&self) -> DtlsParameters;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError>;

    fn close(&self) -> Result<(), EngineError>;
    fn on_close(&self, reaction: CloseReaction);
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn is_closed(&self) -> bool;

    async fn pause(&self) -> Result<(), EngineError>;
    async fn resume(&self) -> Result<(), EngineError>;

    fn close(&self) -> Result<(), EngineError>;
    fn on_close(&self, reaction: CloseReaction);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn producer_id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;

    async fn resume(&self) -> Result<(), EngineError>;

    fn close(&self) -> Result<(), EngineError>;
    fn on_close(&self, reaction: CloseReaction);
}
