//! Push transport: one WebSocket per observed session, fed from that
//! session's transition log.
//!
//! Connecting subscribes to the log with an optional `after` sequence
//! number, so a reconnecting client replays what it missed before
//! following live appends; without it the stream starts at the current
//! tail. The subscription de-duplicates and resyncs
//! internally; by the time frames reach the socket the stream is gap-free
//! and strictly increasing. The socket closes itself after forwarding a
//! terminal transition.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use super::api::SharedState;
use crate::models::Transition;
use crate::store::Subscription;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection
/// dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
pub struct WsQuery {
    /// Replay transitions with a sequence number greater than this.
    pub after: Option<u64>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<SharedState>,
) -> Response {
    // Subscribe before upgrading so an unknown session is a plain 404
    // instead of an immediately-closed socket.
    match state.controller.subscribe(&id, query.after) {
        Ok(subscription) => {
            ws.on_upgrade(move |socket| handle_socket(socket, id, subscription))
                .into_response()
        }
        Err(err) => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
    }
}

async fn handle_socket(socket: WebSocket, session_id: String, subscription: Subscription) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, subscription).await;
    debug!(session = %session_id, "observer socket closed");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines log forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: Subscription,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Log forwarding ──────────────────────────────────────
            result = subscription.recv() => {
                match result {
                    Ok(transition) => {
                        let Ok(json) = frame(&transition) else {
                            break;
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                        // The session is over; nothing more will arrive.
                        if transition.terminal {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }

            // ── Client messages (pong, close, etc.) ─────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore other messages from client (Text, Binary, Ping)
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

/// Wire form sent to observers. The transition itself is the protocol.
pub fn frame(transition: &Transition) -> Result<String, serde_json::Error> {
    serde_json::to_string(transition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::{ErrorRecord, SessionStatus};
    use crate::stage::Stage;

    fn transition(seq: u64, terminal: bool) -> Transition {
        Transition {
            session_id: "abc123".into(),
            stage: Stage::Migration,
            sequence_number: seq,
            payload_summary: "3 changes, lint passed".into(),
            timestamp: Utc::now(),
            status: if terminal { SessionStatus::Complete } else { SessionStatus::Running },
            terminal,
            error: None,
        }
    }

    #[test]
    fn frame_carries_sequence_and_status() {
        let json = frame(&transition(7, false)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["session_id"], "abc123");
        assert_eq!(value["sequence_number"], 7);
        assert_eq!(value["stage"], "migration");
        assert_eq!(value["status"], "running");
        assert_eq!(value["terminal"], false);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn frame_includes_error_record_on_failure() {
        let mut t = transition(4, true);
        t.status = SessionStatus::Failed;
        t.error = Some(ErrorRecord { stage: Stage::Migration, message: "patch rejected".into() });
        let value: serde_json::Value = serde_json::from_str(&frame(&t).unwrap()).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"]["stage"], "migration");
        assert_eq!(value["error"]["message"], "patch rejected");
    }

    #[test]
    fn ws_query_parses_after() {
        let q: WsQuery = serde_json::from_str(r#"{"after": 12}"#).unwrap();
        assert_eq!(q.after, Some(12));
        let q: WsQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.after, None);
    }
}
