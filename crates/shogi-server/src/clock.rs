use std::sync::Arc;
use std::time::Duration;

use shogi_core::protocol::{FinishReason, RoomStatus, ServerMessage};

use crate::state::{now_ms, AppState, Room};
use crate::ws::broadcast;

/// Folds wall-clock time since `last_move_at` into the active side's
/// committed time. Call under the room's write guard, before resetting
/// `last_move_at` or changing the side to move.
pub fn commit(room: &mut Room, now: u64) {
    if room.last_move_at == 0 {
        return;
    }
    let side = room.to_move();
    let elapsed_ms = now.saturating_sub(room.last_move_at);
    let elapsed = elapsed_ms / 1000;

    let main = *room.times.get(side);
    if elapsed <= main {
        *room.times.get_mut(side) = main - elapsed;
    } else {
        *room.times.get_mut(side) = 0;
        *room.current_byoyomi.get_mut(side) -= (elapsed - main) as i64;
    }
    *room.total_consumed.get_mut(side) += elapsed_ms;
}

/// Cancels the room's pending tick, if any.
pub fn stop(state: &AppState, room_id: &str) {
    if let Some((_, handle)) = state.timers.remove(room_id) {
        handle.abort();
    }
}

/// Starts the per-room one-second tick. The caller must already have set
/// `last_move_at`; the tick derives display time from `now -
/// last_move_at`, so late or missed ticks do not drift the clock.
pub fn start(state: &Arc<AppState>, room_id: &str) {
    stop(state, room_id);

    let task_state = state.clone();
    let task_room = room_id.to_string();
    let handle = tokio::spawn(async move {
        tick_loop(task_state, task_room).await;
    });
    state.timers.insert(room_id.to_string(), handle);
}

async fn tick_loop(state: Arc<AppState>, room_id: String) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;

        let finished = {
            let mut room = match state.rooms.get_mut(&room_id) {
                Some(room) => room,
                None => break,
            };
            if room.status != RoomStatus::Playing {
                break;
            }

            let side = room.to_move();
            let now = now_ms();
            let elapsed = now.saturating_sub(room.last_move_at) / 1000;
            let main = *room.times.get(side);
            let (main_left, byo_left) = if elapsed <= main {
                (main - elapsed, *room.current_byoyomi.get(side))
            } else {
                (0, *room.current_byoyomi.get(side) - (elapsed - main) as i64)
            };

            let mut times = room.times;
            *times.get_mut(side) = main_left;
            let mut current_byoyomi = room.current_byoyomi;
            *current_byoyomi.get_mut(side) = byo_left;
            broadcast(
                &state,
                &room.id,
                &ServerMessage::TimeUpdate {
                    times,
                    current_byoyomi,
                },
            );

            if byo_left < 0 {
                commit(&mut room, now);
                room.status = RoomStatus::Finished;
                room.winner = Some(side.flip());
                state.snapshot_room(&room);
                broadcast(
                    &state,
                    &room.id,
                    &ServerMessage::GameFinished {
                        winner: room.winner,
                        reason: FinishReason::Timeout,
                    },
                );
                tracing::info!(room_id = %room.id, loser = ?side, "game over on time");
                true
            } else {
                false
            }
        };

        if finished {
            break;
        }
    }
}
