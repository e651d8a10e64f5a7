//! Error types for the signaling core
//!
//! Every error maps to a stable snake_case code that is sent back to the
//! client. Engine failure details are logged server-side and replaced by a
//! generic code on the wire.

use crate::types::{ConsumerId, Direction, MediaKind, ProducerId, RoomId};
use thiserror::Error;

/// Failure reported by a media engine call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine rejected request: {0}")]
    Rejected(String),

    #[error("Engine resource already closed")]
    Closed,

    #[error("Engine not ready")]
    NotReady,
}

/// Coarse classification used for logging and wire mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller violated protocol ordering or referenced a missing resource
    Precondition,
    /// The engine itself rejected the call
    Engine,
    /// Engine/router not initialised yet, caller should retry later
    NotReady,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SfuError {
    #[error("Session already joined room {0}")]
    AlreadyJoined(RoomId),

    #[error("Session has not joined a room")]
    NotJoined,

    #[error("Rooms are disabled in this deployment")]
    RoomsDisabled,

    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error("Maximum number of rooms reached")]
    RoomLimitReached,

    #[error("Session closed")]
    SessionClosed,

    #[error("{direction} transport for {kind} already exists")]
    TransportExists { direction: Direction, kind: MediaKind },

    #[error("No {direction} transport for {kind}")]
    NoSuchTransport { direction: Direction, kind: MediaKind },

    #[error("{direction} transport for {kind} is not connected")]
    TransportNotReady { direction: Direction, kind: MediaKind },

    #[error("No such producer: {0}")]
    NoSuchProducer(ProducerId),

    #[error("No {0} producer in this session")]
    NoProducerOfKind(MediaKind),

    #[error("No such consumer: {0}")]
    NoSuchConsumer(ConsumerId),

    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("Media engine not ready")]
    NotReady,
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotReady => Self::NotReady,
            other => Self::Engine(other),
        }
    }
}

impl SfuError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Engine(_) => ErrorClass::Engine,
            Self::NotReady => ErrorClass::NotReady,
            _ => ErrorClass::Precondition,
        }
    }

    /// Stable code sent to the client
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AlreadyJoined(_) => "already_joined",
            Self::NotJoined => "not_joined",
            Self::RoomsDisabled => "rooms_disabled",
            Self::RoomFull(_) => "room_full",
            Self::RoomLimitReached => "room_limit_reached",
            Self::SessionClosed => "session_closed",
            Self::TransportExists { .. } => "transport_exists",
            Self::NoSuchTransport { .. } => "no_such_transport",
            Self::TransportNotReady { .. } => "transport_not_ready",
            Self::NoSuchProducer(_) | Self::NoProducerOfKind(_) => "no_such_producer",
            Self::NoSuchConsumer(_) => "no_such_consumer",
            Self::Engine(_) => "engine_error",
            Self::NotReady => "not_ready",
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_mapping() {
        let err: SfuError = EngineError::Rejected("bad dtls".to_string()).into();
        assert_eq!(err.class(), ErrorClass::Engine);
        assert_eq!(err.code(), "engine_error");

        let err: SfuError = EngineError::NotReady.into();
        assert_eq!(err, SfuError::NotReady);
        assert_eq!(err.class(), ErrorClass::NotReady);
    }

    #[test]
    fn test_precondition_codes() {
        let err = SfuError::TransportNotReady {
            direction: Direction::Send,
            kind: MediaKind::Video,
        };
        assert_eq!(err.class(), ErrorClass::Precondition);
        assert_eq!(err.code(), "transport_not_ready");
        assert_eq!(err.to_string(), "producer transport for video is not connected");

        assert_eq!(SfuError::NoProducerOfKind(MediaKind::Audio).code(), "no_such_producer");
    }
}
