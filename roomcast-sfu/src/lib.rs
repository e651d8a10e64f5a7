//! Roomcast SFU signaling core
//!
//! Control plane for a Selective Forwarding Unit. Clients negotiate send and
//! receive transports per media kind, publish producers and subscribe to
//! other peers' producers; the actual RTP forwarding is delegated to a media
//! engine behind the [`MediaEngine`] trait.
//!
//! ## Architecture
//!
//! - **`PeerSession`**: resource bag of one connection (transports, producers, consumers)
//! - **`Room`**: named group of peers sharing a broadcast scope
//! - **`RoomRegistry`**: rooms created on first join and deleted when empty, plus every live session
//! - **`NotificationFanout`**: routes server events to room members or to everyone
//! - **`SignalingHandler`**: request/response state machine driving the engine
//! - **`LoopbackEngine`**: in-process engine that keeps the bookkeeping without moving media
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_sfu::{EngineConfig, LoopbackEngine, NotificationFanout, RoomRegistry, SfuConfig, SignalingHandler};
//!
//! let registry = Arc::new(RoomRegistry::new(Arc::new(SfuConfig::default())));
//! let fanout = Arc::new(NotificationFanout::new(Arc::clone(&registry)));
//! let engine = Arc::new(LoopbackEngine::new(EngineConfig::default()));
//! let handler = SignalingHandler::new(engine, registry, fanout, EngineConfig::default());
//!
//! let (session, events) = handler.connect(PeerId::generate());
//! let reply = handler.handle(&session, request).await?;
//! ```

mod config;
pub mod engine;
mod error;
mod fanout;
mod handler;
pub mod loopback;
mod peer;
mod registry;
mod room;
pub mod signaling;
mod types;

pub use config::{EngineConfig, SfuConfig};
pub use engine::{CloseReason, MediaEngine};
pub use error::{EngineError, ErrorClass, Result, SfuError};
pub use fanout::{EventReceiver, NotificationFanout, Scope};
pub use handler::SignalingHandler;
pub use loopback::LoopbackEngine;
pub use peer::{
    Announcement, ConsumerSlot, JoinOutcome, PeerSession, ProducerSlot, SessionState, Teardown,
    TransportSlot,
};
pub use registry::{Departure, RegistryStats, RoomRegistry};
pub use room::{Room, RoomStats};
pub use signaling::{ClientRequest, Reply, ServerEvent, ServerMessage};
pub use types::{
    ConsumerId, Direction, DtlsParameters, IceCandidates, IceParameters, KindMap, MediaKind,
    PeerId, ProducerId, ProducerInfo, RoomId, RtpCapabilities, RtpParameters, TransportId,
};
