//! WebSocket signaling transport
//!
//! One socket hosts one signaling channel. Text frames are decoded and each
//! request is handled on its own task so a slow engine call never blocks the
//! rest of the connection. Responses and pushed events share one bounded
//! outbound queue drained by a dedicated writer task. Responses wait for
//! room in the queue; an event that does not fit closes the connection.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use roomcast_sfu::signaling::decode_frame;
use roomcast_sfu::{EventReceiver, PeerId, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::AppState;

/// Upgrade `GET /ws` to a signaling socket
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.server.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let peer_id = PeerId::new(nanoid::nanoid!());
    let (session, events) = state.handler.connect(peer_id.clone());

    let (tx, mut rx) = mpsc::channel::<String>(state.server.outbound_queue);
    let (mut ws_sink, mut ws_stream) = socket.split();

    // outbound queue -> socket; stops once every sender, including
    // in-flight request tasks, has gone away
    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                debug!(peer_id = %writer_peer, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let mut forwarder = tokio::spawn(forward_events(events, tx.clone(), peer_id.clone()));
    let mut forwarder_done = false;

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(Message::Text(text)) => match decode_frame(text.as_str()) {
                        Ok(envelope) => {
                            let handler = Arc::clone(&state.handler);
                            let session = Arc::clone(&session);
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                if let Some(reply) = handler.respond(&session, envelope).await {
                                    send_frame(&tx, session.id(), &reply).await;
                                }
                            });
                        }
                        Err(err) => {
                            debug!(peer_id = %peer_id, reason = %err.reason, "Malformed signaling frame");
                            send_frame(&tx, &peer_id, &ServerMessage::bad_request(&err)).await;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    // binary frames are not part of the protocol; ping/pong handled by axum
                    Ok(_) => {}
                    Err(e) => {
                        debug!(peer_id = %peer_id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
            end = &mut forwarder => {
                forwarder_done = true;
                match end {
                    Ok(EventFlow::Overflow) => {
                        warn!(peer_id = %peer_id, "Outbound queue full, client too slow, closing connection");
                        // the client reconnects and receives a fresh snapshot
                        writer.abort();
                    }
                    Ok(EventFlow::Ended) => {}
                    Err(e) => {
                        error!(peer_id = %peer_id, error = %e, "Event forwarder task failed");
                    }
                }
                break;
            }
        }
    }

    state.handler.disconnect(&session);
    drop(tx);
    if !forwarder_done {
        if let Err(e) = forwarder.await {
            error!(peer_id = %peer_id, error = %e, "Event forwarder task failed");
        }
    }

    info!(peer_id = %peer_id, "WebSocket connection closed");
}

/// Why the event forwarder stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventFlow {
    /// Event channel or outbound queue closed
    Ended,
    /// An event did not fit into the outbound queue
    Overflow,
}

/// Fanout events -> outbound queue. Events are never dropped silently: a
/// full queue ends the forwarder so the connection can be closed.
async fn forward_events(mut events: EventReceiver, tx: mpsc::Sender<String>, peer_id: PeerId) -> EventFlow {
    while let Some(event) = events.recv().await {
        match push_event(&tx, &peer_id, &ServerMessage::Event(event)) {
            Pushed::Queued => {}
            Pushed::Full => return EventFlow::Overflow,
            Pushed::Closed => break,
        }
    }
    EventFlow::Ended
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pushed {
    Queued,
    Full,
    Closed,
}

fn encode(peer_id: &PeerId, message: &ServerMessage) -> Option<String> {
    match message.to_text() {
        Ok(text) => Some(text),
        Err(e) => {
            error!(peer_id = %peer_id, error = %e, "Failed to encode signaling frame");
            None
        }
    }
}

/// Queue an event without blocking
fn push_event(tx: &mpsc::Sender<String>, peer_id: &PeerId, message: &ServerMessage) -> Pushed {
    let Some(text) = encode(peer_id, message) else {
        return Pushed::Queued;
    };
    match tx.try_send(text) {
        Ok(()) => Pushed::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => Pushed::Full,
        Err(mpsc::error::TrySendError::Closed(_)) => Pushed::Closed,
    }
}

/// Queue a response, waiting for room. Returns false once the connection is gone.
async fn send_frame(tx: &mpsc::Sender<String>, peer_id: &PeerId, message: &ServerMessage) -> bool {
    let Some(text) = encode(peer_id, message) else {
        return false;
    };
    tx.send(text).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_sfu::ServerEvent;
    use serde_json::Value;

    fn peer_left(id: &str) -> ServerEvent {
        ServerEvent::PeerLeft {
            peer_id: PeerId::from(id),
        }
    }

    fn response(id: u64) -> ServerMessage {
        ServerMessage::Response {
            id: Some(id),
            response: Value::from("success"),
        }
    }

    #[tokio::test]
    async fn test_responses_wait_for_room() {
        let (tx, mut rx) = mpsc::channel(1);
        let peer = PeerId::from("p");

        assert!(send_frame(&tx, &peer, &response(1)).await);
        let pending = {
            let tx = tx.clone();
            let peer = peer.clone();
            tokio::spawn(async move { send_frame(&tx, &peer, &response(2)).await })
        };

        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["id"], 1);
        assert!(pending.await.unwrap());
        let second: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["id"], 2);

        drop(rx);
        assert!(!send_frame(&tx, &peer, &response(3)).await);
    }

    #[tokio::test]
    async fn test_event_overflow_stops_forwarder() {
        let (tx, mut rx) = mpsc::channel(1);
        let (events_tx, events) = mpsc::unbounded_channel();
        events_tx.send(peer_left("x")).unwrap();
        events_tx.send(peer_left("y")).unwrap();

        let flow = forward_events(events, tx, PeerId::from("p")).await;
        assert_eq!(flow, EventFlow::Overflow);

        // the frame that fit is still delivered
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("\"peer-left\""));
        assert!(frame.contains("\"x\""));
    }

    #[tokio::test]
    async fn test_forwarder_ends_with_event_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let (events_tx, events) = mpsc::unbounded_channel();
        events_tx.send(peer_left("x")).unwrap();
        drop(events_tx);

        let flow = forward_events(events, tx, PeerId::from("p")).await;
        assert_eq!(flow, EventFlow::Ended);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
