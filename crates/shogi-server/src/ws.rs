use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;

use shogi_core::protocol::{ClientMessage, RoomStatus, ServerMessage};

use crate::state::{now_ms, AppState, ConnectionHandle};
use crate::{clock, game};

/// Top-level WebSocket handler -- spawned per connection.
pub async fn handle_socket(state: Arc<AppState>, mut socket: WebSocket) {
    let session_id = state.next_session_id.fetch_add(1, Ordering::Relaxed);
    state.connection_count.fetch_add(1, Ordering::Relaxed);

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    state.connections.insert(
        session_id,
        ConnectionHandle {
            session_id,
            user_id: String::new(),
            user_name: String::new(),
            tx: tx.clone(),
            room_id: None,
            message_count: 0,
            rate_limit_window: Instant::now(),
        },
    );

    broadcast_global_count(&state);
    tracing::debug!(session_id, "session connected");

    loop {
        tokio::select! {
            // Outbound: forward queued ServerMessage to the WebSocket.
            Some(msg) = rx.recv() => {
                if let Ok(json) = serde_json::to_string(&msg) {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            // Inbound: read from the WebSocket.
            maybe_msg = socket.recv() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        // Rate limiting: max 20 messages per second,
                        // excess silently dropped.
                        {
                            let mut conn = match state.connections.get_mut(&session_id) {
                                Some(c) => c,
                                None => break,
                            };
                            let now = Instant::now();
                            if now.duration_since(conn.rate_limit_window) > Duration::from_secs(1) {
                                conn.rate_limit_window = now;
                                conn.message_count = 0;
                            }
                            conn.message_count += 1;
                            if conn.message_count > 20 {
                                continue;
                            }
                        }

                        // Malformed payloads are dropped without a reply.
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(err) => {
                                tracing::debug!(session_id, %err, "unparseable message ignored");
                                continue;
                            }
                        };

                        handle_message(&state, session_id, client_msg);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    _ => continue,
                }
            }
        }
    }

    handle_disconnect(&state, session_id);
}

/// Dispatch a single client message.
fn handle_message(state: &Arc<AppState>, session_id: u64, msg: ClientMessage) {
    match msg {
        ClientMessage::JoinRoom {
            room_id,
            mode,
            user_id,
            user_name,
        } => {
            if let Some(mut conn) = state.connections.get_mut(&session_id) {
                conn.user_id = user_id.clone();
                conn.user_name = user_name.clone();
            }
            game::join(state, session_id, &room_id, mode, &user_id, &user_name);
        }
        ClientMessage::SendMessage { room_id, text } => {
            game::send_chat(state, session_id, &room_id, text);
        }
        ClientMessage::UpdateSettings { room_id, settings } => {
            game::update_settings(state, session_id, &room_id, settings);
        }
        ClientMessage::ToggleReady { room_id } => {
            game::toggle_ready(state, session_id, &room_id);
        }
        ClientMessage::Move {
            room_id,
            game_move,
            branch_index,
        } => {
            game::handle_move(state, session_id, &room_id, game_move, branch_index);
        }
        ClientMessage::GameResign { room_id } => {
            game::resign(state, session_id, &room_id);
        }
        ClientMessage::Undo { room_id } => {
            game::undo(state, session_id, &room_id);
        }
        ClientMessage::Reset { room_id } => {
            game::reset(state, session_id, &room_id);
        }
        ClientMessage::Rematch { room_id } => {
            game::rematch(state, session_id, &room_id);
        }
        // A client latency probe; nothing to do server-side.
        ClientMessage::PingLatency => {}
    }
}

/// Removes the session and, if it held a seat mid-game, pauses the clock.
fn handle_disconnect(state: &Arc<AppState>, session_id: u64) {
    let room_id = state
        .connections
        .get(&session_id)
        .and_then(|c| c.room_id.clone());

    state.connections.remove(&session_id);
    state.connection_count.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!(session_id, "session disconnected");

    if let Some(room_id) = room_id {
        if let Some(mut room) = state.rooms.get_mut(&room_id) {
            if let Some(seat) = room.seat_of(session_id) {
                *room.players.get_mut(seat) = None;
                if room.status == RoomStatus::Playing {
                    // Pause: commit accrued time, cancel the tick.
                    clock::commit(&mut room, now_ms());
                    clock::stop(state, &room_id);
                    room.last_move_at = 0;
                    state.snapshot_room(&room);
                    tracing::info!(%room_id, ?seat, "player left mid-game, clock paused");
                }
            }

            broadcast(
                state,
                &room_id,
                &ServerMessage::ConnectionStatusUpdate {
                    sente: room.players.get(shogi_core::Side::Sente).is_some(),
                    gote: room.players.get(shogi_core::Side::Gote).is_some(),
                },
            );
            broadcast(
                state,
                &room_id,
                &ServerMessage::UpdateRoomCount {
                    count: state.room_member_count(&room_id),
                },
            );
        }
    }

    broadcast_global_count(state);
}

/// Fan a message out to every session in a room.
pub fn broadcast(state: &AppState, room_id: &str, msg: &ServerMessage) {
    for conn in state.connections.iter() {
        if conn.room_id.as_deref() == Some(room_id) {
            let _ = conn.tx.send(msg.clone());
        }
    }
}

pub fn send_to(state: &AppState, session_id: u64, msg: ServerMessage) {
    if let Some(conn) = state.connections.get(&session_id) {
        let _ = conn.tx.send(msg);
    }
}

/// Everyone sees the global connection count change.
pub fn broadcast_global_count(state: &AppState) {
    let count = state.connection_count.load(Ordering::Relaxed);
    for conn in state.connections.iter() {
        let _ = conn.tx.send(ServerMessage::UpdateGlobalCount { count });
    }
}
