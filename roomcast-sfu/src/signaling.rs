//! Signaling wire format
//!
//! Requests arrive as JSON text frames:
//! `{"id": 7, "type": "start-producing", "data": {"kind": "video", ...}}`.
//! Each request carrying an `id` receives exactly one
//! `{"id": 7, "response": ...}` frame. Server pushes are
//! `{"event": "new-producer", "data": {...}}`.

use crate::error::{ErrorClass, SfuError};
use crate::types::{
    ConsumerId, DtlsParameters, IceCandidates, IceParameters, MediaKind, PeerId, ProducerId,
    ProducerInfo, RoomId, RtpCapabilities, RtpParameters, TransportId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Client → server request
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },

    GetRtpCapabilities,

    CreateProducerTransport { kind: MediaKind },

    #[serde(rename_all = "camelCase")]
    ConnectProducerTransport {
        kind: MediaKind,
        dtls_parameters: DtlsParameters,
    },

    #[serde(rename_all = "camelCase")]
    StartProducing {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    CreateConsumerTransport { kind: MediaKind },

    #[serde(rename_all = "camelCase")]
    ConnectConsumerTransport {
        kind: MediaKind,
        dtls_parameters: DtlsParameters,
    },

    #[serde(rename_all = "camelCase")]
    StartConsuming {
        producer_id: ProducerId,
        kind: MediaKind,
        remote_capabilities: RtpCapabilities,
    },

    #[serde(rename_all = "camelCase")]
    ResumeConsuming { consumer_id: ConsumerId },

    PauseProducing { kind: MediaKind },

    ResumeProducing { kind: MediaKind },

    CloseProducer { kind: MediaKind },
}

impl ClientRequest {
    /// Wire name, used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::GetRtpCapabilities => "get-rtp-capabilities",
            Self::CreateProducerTransport { .. } => "create-producer-transport",
            Self::ConnectProducerTransport { .. } => "connect-producer-transport",
            Self::StartProducing { .. } => "start-producing",
            Self::CreateConsumerTransport { .. } => "create-consumer-transport",
            Self::ConnectConsumerTransport { .. } => "connect-consumer-transport",
            Self::StartConsuming { .. } => "start-consuming",
            Self::ResumeConsuming { .. } => "resume-consuming",
            Self::PauseProducing { .. } => "pause-producing",
            Self::ResumeProducing { .. } => "resume-producing",
            Self::CloseProducer { .. } => "close-producer",
        }
    }

    /// Connect messages answer with bare `"success"` / `"error"` strings
    const fn replies_with_status(&self) -> bool {
        matches!(
            self,
            Self::ConnectProducerTransport { .. } | Self::ConnectConsumerTransport { .. }
        )
    }
}

/// A decoded frame: optional correlation id plus the request
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: Option<u64>,
    pub request: ClientRequest,
}

/// A frame that could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub id: Option<u64>,
    pub reason: String,
}

/// Decode one text frame
pub fn decode_frame(text: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError {
        id: None,
        reason: e.to_string(),
    })?;
    let id = value.get("id").and_then(Value::as_u64);
    let request = serde_json::from_value(value).map_err(|e| DecodeError {
        id,
        reason: e.to_string(),
    })?;
    Ok(Envelope { id, request })
}

/// Transport parameters handed to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
}

/// Consumer parameters handed to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Successful handler outcome
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `{ok: true}`
    Ok,
    /// Router capabilities, `None` while the engine is not ready
    RtpCapabilities(Option<RtpCapabilities>),
    Transport(TransportInfo),
    /// `"success"`
    Connected,
    Produced { id: ProducerId },
    Consumer(ConsumerInfo),
}

/// Build the `response` payload for a request outcome
#[must_use]
pub fn response_payload(request: &ClientRequest, outcome: &Result<Reply, SfuError>) -> Value {
    match outcome {
        Ok(Reply::Ok) => json!({ "ok": true }),
        Ok(Reply::RtpCapabilities(caps)) => caps.as_ref().map_or(Value::Null, |c| c.0.clone()),
        Ok(Reply::Transport(info)) => json!(info),
        Ok(Reply::Connected) => json!("success"),
        Ok(Reply::Produced { id }) => json!({ "id": id }),
        Ok(Reply::Consumer(info)) => json!(info),
        Err(_) if request.replies_with_status() => json!("error"),
        Err(err)
            if err.class() == ErrorClass::NotReady
                && matches!(request, ClientRequest::GetRtpCapabilities) =>
        {
            Value::Null
        }
        Err(err) => json!({ "error": err.code() }),
    }
}

/// Server → client push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ExistingProducers { producers: Vec<ProducerInfo> },

    NewProducer(ProducerInfo),

    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: ProducerId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        producer_socket_id: Option<PeerId>,
    },

    #[serde(rename_all = "camelCase")]
    PeerProducerStateChanged {
        producer_socket_id: PeerId,
        kind: MediaKind,
        paused: bool,
    },

    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: PeerId },

    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },
}

impl ServerEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::ExistingProducers { .. } => "existing-producers",
            Self::NewProducer(_) => "new-producer",
            Self::ProducerClosed { .. } => "producer-closed",
            Self::PeerProducerStateChanged { .. } => "peer-producer-state-changed",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
        }
    }
}

/// Anything written to the socket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response { id: Option<u64>, response: Value },
    Event(ServerEvent),
}

impl ServerMessage {
    /// Reply to a frame that failed to decode
    #[must_use]
    pub fn bad_request(err: &DecodeError) -> Self {
        Self::Response {
            id: err.id,
            response: json!({ "error": "bad_request" }),
        }
    }

    /// Serialize to a text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_request_with_payload() {
        let frame = r#"{"id": 3, "type": "start-consuming", "data": {
            "producerId": "p1", "kind": "video", "remoteCapabilities": {"codecs": []}
        }}"#;
        let envelope = decode_frame(frame).unwrap();
        assert_eq!(envelope.id, Some(3));
        assert_eq!(
            envelope.request,
            ClientRequest::StartConsuming {
                producer_id: ProducerId::from("p1"),
                kind: MediaKind::Video,
                remote_capabilities: RtpCapabilities(json!({ "codecs": [] })),
            }
        );
    }

    #[test]
    fn test_decode_unit_request() {
        let envelope = decode_frame(r#"{"id": 1, "type": "get-rtp-capabilities"}"#).unwrap();
        assert_eq!(envelope.request, ClientRequest::GetRtpCapabilities);
        assert_eq!(envelope.request.name(), "get-rtp-capabilities");
    }

    #[test]
    fn test_decode_errors_keep_correlation_id() {
        let err = decode_frame(r#"{"id": 9, "type": "fly-to-moon"}"#).unwrap_err();
        assert_eq!(err.id, Some(9));

        let err = decode_frame(r#"{"id": 10, "type": "create-producer-transport", "data": {"kind": "screen"}}"#)
            .unwrap_err();
        assert_eq!(err.id, Some(10));

        let err = decode_frame("not json").unwrap_err();
        assert_eq!(err.id, None);
        let reply: Value = serde_json::from_str(&ServerMessage::bad_request(&err).to_text().unwrap()).unwrap();
        assert_eq!(reply, json!({ "id": null, "response": { "error": "bad_request" } }));
    }

    #[test]
    fn test_connect_replies_are_bare_strings() {
        let request = ClientRequest::ConnectProducerTransport {
            kind: MediaKind::Audio,
            dtls_parameters: DtlsParameters::default(),
        };
        assert_eq!(response_payload(&request, &Ok(Reply::Connected)), json!("success"));
        let failed = Err(SfuError::NoSuchTransport {
            direction: crate::types::Direction::Send,
            kind: MediaKind::Audio,
        });
        assert_eq!(response_payload(&request, &failed), json!("error"));
    }

    #[test]
    fn test_error_payloads() {
        let request = ClientRequest::StartProducing {
            kind: MediaKind::Video,
            rtp_parameters: RtpParameters::default(),
        };
        let outcome = Err(SfuError::TransportNotReady {
            direction: crate::types::Direction::Send,
            kind: MediaKind::Video,
        });
        assert_eq!(
            response_payload(&request, &outcome),
            json!({ "error": "transport_not_ready" })
        );

        let caps = ClientRequest::GetRtpCapabilities;
        assert_eq!(response_payload(&caps, &Err(SfuError::NotReady)), Value::Null);
        assert_eq!(response_payload(&caps, &Ok(Reply::RtpCapabilities(None))), Value::Null);
    }

    #[test]
    fn test_event_frames() {
        let event = ServerMessage::Event(ServerEvent::ProducerClosed {
            producer_id: ProducerId::from("p1"),
            producer_socket_id: None,
        });
        let value: Value = serde_json::from_str(&event.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({ "event": "producer-closed", "data": { "producerId": "p1" } }));

        let response = ServerMessage::Response {
            id: Some(4),
            response: json!({ "ok": true }),
        };
        let value: Value = serde_json::from_str(&response.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({ "id": 4, "response": { "ok": true } }));
    }

    #[test]
    fn test_new_producer_event_shape() {
        let event = ServerEvent::NewProducer(ProducerInfo {
            producer_id: ProducerId::from("p1"),
            producer_socket_id: PeerId::from("s1"),
            kind: MediaKind::Audio,
        });
        assert_eq!(event.event_type(), "new-producer");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["producerSocketId"], "s1");
    }
}
