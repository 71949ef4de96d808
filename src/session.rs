//! Session/transport actor: one task per WebSocket connection, owning both
//! halves of the socket so heartbeats, inbound frames, and outbound
//! broadcasts all interleave through a single `select!` loop rather than a
//! lock (the same single-writer-task idiom the room actor uses).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ErrorReason;
use crate::ot::Operation;
use crate::protocol::{parse_and_validate, ClientMessage, ServerMessage};
use crate::ratelimit::{RateLimits, SessionLimiter};
use crate::room::{RoomCommand, SessionHandle};
use crate::AppState;

/// What room/clientId this session currently occupies, if any. A session
/// belongs to at most one room at a time.
struct Joined {
    room_id: String,
    client_id: String,
}

/// Drive one WebSocket connection until it disconnects, times out, or is
/// force-closed (e.g. preempted by a reconnect under the same `clientId`).
pub async fn run(session_id: u64, socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerMessage>(state.config.outbound_queue_len);
    let closer = Arc::new(Notify::new());
    let backpressure_since = Arc::new(std::sync::Mutex::new(None));

    let mut limiter = SessionLimiter::new(RateLimits {
        op_rate: state.config.op_rate_limit,
        op_burst: state.config.op_burst,
        cursor_rate: state.config.cursor_rate_limit,
        cursor_burst: state.config.cursor_burst,
    });

    let mut joined: Option<Joined> = None;
    let join_deadline = Instant::now() + state.config.join_deadline;
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.tick().await; // first tick fires immediately, skip it

    let mut awaiting_pong = false;
    let mut missed_heartbeats = 0u32;

    'session: loop {
        // Recomputed every iteration (mirrors the room actor's idle-deadline
        // pattern): only armed while the outbound queue is actually
        // overflowing, cleared the moment a send succeeds again.
        let backpressure_deadline = backpressure_since
            .lock()
            .unwrap()
            .map(|since: Instant| since + state.config.backpressure_grace);

        tokio::select! {
            biased;

            _ = closer.notified() => {
                info!(session_id, "session force-closed");
                break 'session;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        missed_heartbeats = 0;
                        if !handle_frame(&text, session_id, &state, &outbound_tx, &closer, &backpressure_since, &mut joined, &mut limiter).await {
                            break 'session;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                        missed_heartbeats = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => break 'session,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(session_id, error = %e, "websocket read error, closing session");
                        break 'session;
                    }
                }
            }

            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { continue };
                if sink.send(Message::text(to_json(&msg))).await.is_err() {
                    break 'session;
                }
            }

            _ = heartbeat.tick() => {
                if awaiting_pong {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= state.config.heartbeat_miss {
                        warn!(session_id, "missed {missed_heartbeats} heartbeats, closing session");
                        let frame = ServerMessage::error(
                            ErrorReason::HeartbeatTimeout,
                            ErrorReason::HeartbeatTimeout.to_string(),
                        );
                        let _ = sink.send(Message::text(to_json(&frame))).await;
                        break 'session;
                    }
                }
                awaiting_pong = true;
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break 'session;
                }
            }

            _ = tokio::time::sleep_until(join_deadline), if joined.is_none() => {
                info!(session_id, "join deadline exceeded without a JOIN_ROOM, closing session");
                break 'session;
            }

            _ = tokio::time::sleep_until(backpressure_deadline.unwrap_or_else(Instant::now)), if backpressure_deadline.is_some() => {
                warn!(session_id, "outbound queue stayed full past the backpressure grace period, closing session");
                let frame = ServerMessage::error(
                    ErrorReason::Backpressure,
                    ErrorReason::Backpressure.to_string(),
                );
                let _ = sink.send(Message::text(to_json(&frame))).await;
                break 'session;
            }
        }
    }

    if let Some(Joined { room_id, client_id }) = joined {
        if let Some(tx) = state.rooms.lookup(&room_id) {
            let _ = tx
                .send(RoomCommand::SessionClosed {
                    client_id,
                    session_id,
                })
                .await;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    info!(session_id, "session closed");
}

/// Parse, validate, and dispatch one inbound frame. Returns `false` if the
/// session should close as a result (currently: never — malformed frames are
/// rejected in place, the connection stays open).
async fn handle_frame(
    raw: &str,
    session_id: u64,
    state: &Arc<AppState>,
    outbound_tx: &mpsc::Sender<ServerMessage>,
    closer: &Arc<Notify>,
    backpressure_since: &Arc<std::sync::Mutex<Option<Instant>>>,
    joined: &mut Option<Joined>,
    limiter: &mut SessionLimiter,
) -> bool {
    let msg = match parse_and_validate(raw) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = outbound_tx.try_send(ServerMessage::error(ErrorReason::ValidationFailed, e.to_string()));
            return true;
        }
    };

    match msg {
        ClientMessage::JoinRoom {
            room_id,
            client_id,
            user_id,
        } => {
            if let Some(prior) = joined.take() {
                if let Some(tx) = state.rooms.lookup(&prior.room_id) {
                    let _ = tx.send(RoomCommand::Leave { client_id: prior.client_id }).await;
                }
            }

            let tx = state.rooms.get_or_create(&room_id).await;
            let handle = SessionHandle {
                session_id,
                room_id: room_id.clone(),
                outbound: outbound_tx.clone(),
                closer: closer.clone(),
                backpressure_since: backpressure_since.clone(),
            };
            let _ = tx
                .send(RoomCommand::Join {
                    client_id: client_id.clone(),
                    user_id: Some(user_id),
                    handle,
                })
                .await;
            *joined = Some(Joined {
                room_id,
                client_id,
            });
        }

        ClientMessage::LeaveRoom { room_id, client_id } => {
            if let Some(tx) = state.rooms.lookup(&room_id) {
                let _ = tx.send(RoomCommand::Leave { client_id: client_id.clone() }).await;
            }
            if matches!(joined, Some(j) if j.room_id == room_id && j.client_id == client_id) {
                *joined = None;
            }
        }

        ClientMessage::OtOp {
            room_id,
            client_id,
            operation,
        } => {
            if !ensure_joined(joined, &room_id, &client_id) {
                let _ = outbound_tx.try_send(ServerMessage::op_error(
                    ErrorReason::ValidationFailed,
                    "not joined to this room",
                    operation.id.clone(),
                ));
                return true;
            }
            if !limiter.allow_op() {
                let _ = outbound_tx.try_send(ServerMessage::op_error(
                    ErrorReason::RateLimited,
                    ErrorReason::RateLimited.to_string(),
                    operation.id.clone(),
                ));
                return true;
            }
            let Some(tx) = state.rooms.lookup(&room_id) else {
                return true;
            };
            let op = Operation {
                id: operation.id,
                kind: operation.kind,
                position: operation.position,
                payload: operation.payload,
                client_id: client_id.clone(),
                user_id: None,
                version: operation.version,
            };
            let _ = tx
                .send(RoomCommand::SubmitOp {
                    client_id,
                    operation: op,
                })
                .await;
        }

        ClientMessage::CursorUpdate {
            room_id,
            client_id,
            cursor,
            selection,
        } => {
            if !ensure_joined(joined, &room_id, &client_id) {
                return true;
            }
            if !limiter.allow_cursor() {
                let _ = outbound_tx.try_send(ServerMessage::error(
                    ErrorReason::RateLimited,
                    ErrorReason::RateLimited.to_string(),
                ));
                return true;
            }
            let Some(tx) = state.rooms.lookup(&room_id) else {
                return true;
            };
            let _ = tx
                .send(RoomCommand::UpdateCursor {
                    client_id,
                    cursor,
                    selection,
                })
                .await;
        }

        ClientMessage::SyncState {
            room_id,
            client_id,
            from_version,
        } => {
            if !ensure_joined(joined, &room_id, &client_id) {
                return true;
            }
            let Some(tx) = state.rooms.lookup(&room_id) else {
                return true;
            };
            let _ = tx
                .send(RoomCommand::RequestSync {
                    client_id,
                    from_version,
                })
                .await;
        }

        ClientMessage::Ping { timestamp } => {
            let _ = outbound_tx.try_send(ServerMessage::Pong { timestamp });
        }
    }

    true
}

fn ensure_joined(joined: &Option<Joined>, room_id: &str, client_id: &str) -> bool {
    matches!(joined, Some(j) if j.room_id == room_id && j.client_id == client_id)
}

fn to_json(msg: &ServerMessage) -> String {
    serde_json::to_string(msg).expect("ServerMessage always serializes")
}
