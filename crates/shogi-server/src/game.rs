use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::Rng;

use shogi_core::board::Side;
use shogi_core::moves::{replay, side_to_move, Move, MoveTime, RecordedMove};
use shogi_core::protocol::{
    FinishReason, GameSettings, Role, RoomMode, RoomStatus, ServerMessage,
};
use shogi_core::repetition::{classify_repetition, RepetitionVerdict};
use shogi_core::sfen::position_key;
use shogi_core::validation::{is_checkmate, is_king_in_check, is_legal};
use shogi_core::{apply_move, initial_board, Hands};

use crate::clock;
use crate::state::{now_ms, AppState, Room};
use crate::ws::{broadcast, broadcast_global_count, send_to};

/// Full authoritative state for one session.
fn sync_for(room: &Room, role: Role) -> ServerMessage {
    ServerMessage::Sync {
        history: room.history.clone(),
        status: room.status,
        winner: room.winner,
        your_role: role,
        ready: room.ready,
        settings: room.settings,
        times: room.times,
        rematch_requests: room.rematch_requests,
        player_names: room.player_names.clone(),
    }
}

/// Sends each room member its own sync (roles differ per session).
fn sync_members(state: &AppState, room: &Room) {
    for conn in state.connections.iter() {
        if conn.room_id.as_deref() == Some(room.id.as_str()) {
            let _ = conn.tx.send(sync_for(room, room.role_of(conn.session_id)));
        }
    }
}

fn connection_status(room: &Room) -> ServerMessage {
    ServerMessage::ConnectionStatusUpdate {
        sente: room.players.get(Side::Sente).is_some(),
        gote: room.players.get(Side::Gote).is_some(),
    }
}

/// Rebuilds board, hands, and fingerprint counts from the history.
fn rebuild_from_history(room: &mut Room) {
    let (board, hands) = replay(&room.history);
    room.board = board;
    room.hands = hands;

    room.sfen_history.clear();
    let mut b = initial_board();
    let mut h = Hands::empty();
    *room
        .sfen_history
        .entry(position_key(&b, Side::Sente, &h))
        .or_insert(0) += 1;
    for (i, record) in room.history.iter().enumerate() {
        let (nb, nh) = apply_move(&b, &h, shogi_core::moves::mover_at(i), record.mv);
        b = nb;
        h = nh;
        *room
            .sfen_history
            .entry(position_key(&b, side_to_move(i + 1), &h))
            .or_insert(0) += 1;
    }
}

pub fn join(
    state: &Arc<AppState>,
    session_id: u64,
    room_id: &str,
    mode: RoomMode,
    user_id: &str,
    user_name: &str,
) {
    if let Some(mut conn) = state.connections.get_mut(&session_id) {
        conn.room_id = Some(room_id.to_string());
    } else {
        return;
    }

    let resume = {
        let mut room = state
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                tracing::info!(%room_id, "room created");
                Room::new(room_id.to_string(), mode, state.default_settings())
            });

        let role = room.assign_seat(session_id, user_id, user_name);
        tracing::debug!(%room_id, session_id, ?role, "session joined");

        let resume = room.status == RoomStatus::Playing
            && room.both_seats_online()
            && !state.timers.contains_key(room_id);
        if resume {
            room.last_move_at = now_ms();
        }

        state.snapshot_room(&room);
        send_to(state, session_id, sync_for(&room, role));
        broadcast(
            state,
            room_id,
            &ServerMessage::PlayerNamesUpdated {
                player_names: room.player_names.clone(),
            },
        );
        broadcast(state, room_id, &connection_status(&room));
        broadcast(
            state,
            room_id,
            &ServerMessage::UpdateRoomCount {
                count: state.room_member_count(room_id),
            },
        );
        resume
    };

    broadcast_global_count(state);

    if resume {
        clock::start(state, room_id);
    }
}

pub fn send_chat(state: &Arc<AppState>, session_id: u64, room_id: &str, text: String) {
    let (user_id, user_name) = match state.connections.get(&session_id) {
        Some(conn) if conn.room_id.as_deref() == Some(room_id) => {
            (conn.user_id.clone(), conn.user_name.clone())
        }
        _ => return,
    };

    let role = match state.rooms.get(room_id) {
        Some(room) => room.role_of(session_id),
        None => return,
    };

    let msg = ServerMessage::ReceiveMessage {
        id: state.next_message_id.fetch_add(1, Ordering::Relaxed),
        text,
        role,
        user_name,
        user_id,
        timestamp: now_ms(),
    };
    broadcast(state, room_id, &msg);
}

pub fn update_settings(
    state: &Arc<AppState>,
    session_id: u64,
    room_id: &str,
    settings: GameSettings,
) {
    let mut room = match state.rooms.get_mut(room_id) {
        Some(room) => room,
        None => return,
    };
    if room.status != RoomStatus::Waiting || room.seat_of(session_id).is_none() {
        return;
    }

    room.settings = settings;
    room.times = shogi_core::BySide::new(settings.initial_time, settings.initial_time);
    room.current_byoyomi =
        shogi_core::BySide::new(settings.byoyomi as i64, settings.byoyomi as i64);

    state.snapshot_room(&room);
    broadcast(state, room_id, &ServerMessage::SettingsUpdated { settings });
}

pub fn toggle_ready(state: &Arc<AppState>, session_id: u64, room_id: &str) {
    let started = {
        let mut room = match state.rooms.get_mut(room_id) {
            Some(room) => room,
            None => return,
        };
        if room.status != RoomStatus::Waiting {
            return;
        }
        let seat = match room.seat_of(session_id) {
            Some(seat) => seat,
            None => return,
        };

        let flag = room.ready.get_mut(seat);
        *flag = !*flag;

        let start = *room.ready.get(Side::Sente) && *room.ready.get(Side::Gote);
        if start {
            start_game(&mut room);
        }

        state.snapshot_room(&room);
        broadcast(
            state,
            room_id,
            &ServerMessage::ReadyStatus { ready: room.ready },
        );
        if start {
            broadcast(state, room_id, &ServerMessage::GameStarted);
            // Fresh syncs carry each player's (possibly swapped) role.
            sync_members(state, &room);
            tracing::info!(room_id = %room.id, game = room.game_count, "game started");
        }
        start
    };

    if started {
        clock::start(state, room_id);
    }
}

/// Waiting -> playing transition. The caller broadcasts and starts the
/// clock once the mutation is snapshot.
fn start_game(room: &mut Room) {
    let swap = room.settings.random_turn
        && !(room.game_count > 0 && room.settings.fix_turn)
        && rand::rng().random_bool(0.5);
    if swap {
        room.players.swap();
        room.user_ids.swap();
        room.player_names.swap();
    }

    room.reset_position();
    room.game_count += 1;
    room.game_started_at = now_ms();
    room.last_move_at = room.game_started_at;
    room.status = RoomStatus::Playing;
}

pub fn handle_move(
    state: &Arc<AppState>,
    session_id: u64,
    room_id: &str,
    mv: Move,
    branch_index: Option<usize>,
) {
    let restart_clock = {
        let mut room = match state.rooms.get_mut(room_id) {
            Some(room) => room,
            None => return,
        };
        match room.status {
            RoomStatus::Playing => play_move(state, &mut room, session_id, mv),
            RoomStatus::Analysis => {
                analysis_move(state, &mut room, mv, branch_index);
                false
            }
            _ => return,
        }
    };

    if restart_clock {
        clock::start(state, room_id);
    }
}

/// The authoritative move pipeline. Returns true when the game goes on
/// and the clock must be restarted for the next mover.
fn play_move(state: &AppState, room: &mut Room, session_id: u64, mv: Move) -> bool {
    let side = match room.seat_of(session_id) {
        Some(side) if side == room.to_move() => side,
        _ => return false,
    };
    if !is_legal(&room.board, &room.hands, side, mv, true) {
        return false;
    }

    let now = now_ms();
    // A paused clock (last_move_at = 0) charges nothing to this move.
    let elapsed_ms = if room.last_move_at == 0 {
        0
    } else {
        now.saturating_sub(room.last_move_at)
    };
    clock::commit(room, now);
    clock::stop(state, &room.id);

    let (board, hands) = apply_move(&room.board, &room.hands, side, mv);
    room.board = board;
    room.hands = hands;

    let opponent = side.flip();
    let is_check = is_king_in_check(&room.board, opponent);
    room.history.push(RecordedMove {
        mv,
        is_check,
        time: MoveTime {
            now: elapsed_ms / 1000,
            total: *room.total_consumed.get(side) / 1000,
        },
    });
    *room.current_byoyomi.get_mut(side) = room.settings.byoyomi as i64;

    let key = position_key(&room.board, room.to_move(), &room.hands);
    let count = {
        let entry = room.sfen_history.entry(key).or_insert(0);
        *entry += 1;
        *entry
    };

    let mut finish = None;
    if is_check && is_checkmate(&room.board, &room.hands, opponent) {
        finish = Some((Some(side), FinishReason::Checkmate));
    } else if count >= 4 {
        finish = Some(match classify_repetition(&room.history) {
            RepetitionVerdict::Draw => (None, FinishReason::Sennichite),
            RepetitionVerdict::PerpetualCheckBy(checker) => {
                (Some(checker.flip()), FinishReason::IllegalSennichite)
            }
        });
    }

    if let Some((winner, _)) = finish {
        room.status = RoomStatus::Finished;
        room.winner = winner;
    } else {
        room.last_move_at = now;
    }

    state.snapshot_room(room);

    let record = *room.history.last().expect("just pushed");
    broadcast(
        state,
        &room.id,
        &ServerMessage::Move {
            game_move: record.mv,
            is_check: record.is_check,
            time: record.time,
        },
    );
    if let Some((winner, reason)) = finish {
        broadcast(
            state,
            &room.id,
            &ServerMessage::GameFinished { winner, reason },
        );
        tracing::info!(room_id = %room.id, ?winner, ?reason, "game finished");
        false
    } else {
        true
    }
}

/// Free-move branch mode: optionally truncate to a prefix, then append.
fn analysis_move(state: &AppState, room: &mut Room, mv: Move, branch_index: Option<usize>) {
    if let Some(index) = branch_index {
        if index < room.history.len() {
            room.history.truncate(index);
            rebuild_from_history(room);
        }
    }

    let side = room.to_move();
    if !is_legal(&room.board, &room.hands, side, mv, true) {
        return;
    }

    let (board, hands) = apply_move(&room.board, &room.hands, side, mv);
    room.board = board;
    room.hands = hands;
    let is_check = is_king_in_check(&room.board, side.flip());
    room.history.push(RecordedMove {
        mv,
        is_check,
        time: MoveTime::default(),
    });
    let key = position_key(&room.board, room.to_move(), &room.hands);
    *room.sfen_history.entry(key).or_insert(0) += 1;

    state.snapshot_room(room);
    sync_members(state, room);
}

pub fn resign(state: &Arc<AppState>, session_id: u64, room_id: &str) {
    let mut room = match state.rooms.get_mut(room_id) {
        Some(room) => room,
        None => return,
    };
    if room.status != RoomStatus::Playing {
        return;
    }
    let loser = match room.seat_of(session_id) {
        Some(seat) => seat,
        None => return,
    };

    clock::commit(&mut room, now_ms());
    clock::stop(state, &room.id);
    room.status = RoomStatus::Finished;
    room.winner = Some(loser.flip());

    state.snapshot_room(&room);
    broadcast(
        state,
        room_id,
        &ServerMessage::GameFinished {
            winner: room.winner,
            reason: FinishReason::Resign,
        },
    );
    tracing::info!(%room_id, ?loser, "resignation");
}

pub fn undo(state: &Arc<AppState>, session_id: u64, room_id: &str) {
    let mut room = match state.rooms.get_mut(room_id) {
        Some(room) => room,
        None => return,
    };
    if room.status == RoomStatus::Playing
        || room.seat_of(session_id).is_none()
        || room.history.is_empty()
    {
        return;
    }

    room.history.pop();
    rebuild_from_history(&mut room);

    state.snapshot_room(&room);
    sync_members(state, &room);
}

pub fn reset(state: &Arc<AppState>, session_id: u64, room_id: &str) {
    let mut room = match state.rooms.get_mut(room_id) {
        Some(room) => room,
        None => return,
    };
    if room.status == RoomStatus::Playing || room.seat_of(session_id).is_none() {
        return;
    }

    room.reset_position();
    room.ready = Default::default();
    room.rematch_requests = Default::default();
    if room.status != RoomStatus::Analysis {
        room.status = RoomStatus::Waiting;
    }

    state.snapshot_room(&room);
    sync_members(state, &room);
}

pub fn rematch(state: &Arc<AppState>, session_id: u64, room_id: &str) {
    let mut room = match state.rooms.get_mut(room_id) {
        Some(room) => room,
        None => return,
    };
    if room.status != RoomStatus::Finished {
        return;
    }
    let seat = match room.seat_of(session_id) {
        Some(seat) => seat,
        None => return,
    };

    *room.rematch_requests.get_mut(seat) = true;
    let agreed =
        *room.rematch_requests.get(Side::Sente) && *room.rematch_requests.get(Side::Gote);
    let requests = room.rematch_requests;
    if agreed {
        room.reset_position();
        room.ready = Default::default();
        room.rematch_requests = Default::default();
        room.status = RoomStatus::Waiting;
    }

    state.snapshot_room(&room);
    broadcast(
        state,
        room_id,
        &ServerMessage::RematchStatus {
            rematch_requests: requests,
        },
    );
    if agreed {
        sync_members(state, &room);
        tracing::info!(%room_id, "rematch agreed, back to waiting");
    }
}
