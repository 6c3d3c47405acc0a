use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use shogi_core::board::{initial_board, Board, BySide, Hands, Side};
use shogi_core::moves::RecordedMove;
use shogi_core::protocol::{GameSettings, Role, RoomMode, RoomStatus, ServerMessage};
use shogi_core::sfen::position_key;

use crate::db::SnapshotCmd;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to push messages to a connected WebSocket client.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub session_id: u64,
    pub user_id: String,
    pub user_name: String,
    pub tx: mpsc::UnboundedSender<ServerMessage>,
    pub room_id: Option<String>,
    /// Messages received in the current second window.
    pub message_count: u32,
    pub rate_limit_window: Instant,
}

/// Server-wide tunables, read from the environment at boot.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub initial_time: u64,
    pub byoyomi: u64,
    pub gc_interval_secs: u64,
    pub room_stale_ms: u64,
    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            initial_time: env_u64("INITIAL_TIME_SECS", 600),
            byoyomi: env_u64("BYOYOMI_SECS", 30),
            gc_interval_secs: env_u64("GC_INTERVAL_SECS", 3600),
            room_stale_ms: env_u64("ROOM_STALE_SECS", 86_400) * 1000,
            max_connections: env_u64("MAX_CONNECTIONS", 100) as u32,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// A game room. Everything here round-trips through a snapshot; the
/// running clock task lives in `AppState::timers` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub status: RoomStatus,
    pub board: Board,
    pub hands: Hands,
    pub history: Vec<RecordedMove>,
    /// Position fingerprint -> times reached this game.
    pub sfen_history: HashMap<String, u32>,
    /// Seat -> live session id. Cleared when a snapshot is reloaded.
    #[serde(default)]
    pub players: BySide<Option<u64>>,
    /// Seat -> opaque user id, sticky across reconnects.
    #[serde(default)]
    pub user_ids: BySide<Option<String>>,
    #[serde(default)]
    pub player_names: BySide<Option<String>>,
    #[serde(default)]
    pub ready: BySide<bool>,
    #[serde(default)]
    pub rematch_requests: BySide<bool>,
    pub settings: GameSettings,
    /// Remaining main time, seconds.
    pub times: BySide<u64>,
    /// Remaining byoyomi for the move in progress, seconds.
    pub current_byoyomi: BySide<i64>,
    /// Milliseconds consumed this game, monotone.
    #[serde(default)]
    pub total_consumed: BySide<u64>,
    /// Wall clock of the last clock reset point, ms epoch.
    #[serde(default)]
    pub last_move_at: u64,
    #[serde(default)]
    pub game_started_at: u64,
    #[serde(default)]
    pub game_count: u32,
    #[serde(default)]
    pub winner: Option<Side>,
}

impl Room {
    pub fn new(id: String, mode: RoomMode, settings: GameSettings) -> Room {
        let board = initial_board();
        let hands = Hands::empty();
        let mut sfen_history = HashMap::new();
        sfen_history.insert(position_key(&board, Side::Sente, &hands), 1);

        Room {
            id,
            status: match mode {
                RoomMode::Play => RoomStatus::Waiting,
                RoomMode::Analysis => RoomStatus::Analysis,
            },
            board,
            hands,
            history: Vec::new(),
            sfen_history,
            players: BySide::default(),
            user_ids: BySide::default(),
            player_names: BySide::default(),
            ready: BySide::default(),
            rematch_requests: BySide::default(),
            times: BySide::new(settings.initial_time, settings.initial_time),
            current_byoyomi: BySide::new(settings.byoyomi as i64, settings.byoyomi as i64),
            settings,
            total_consumed: BySide::default(),
            last_move_at: 0,
            game_started_at: 0,
            game_count: 0,
            winner: None,
        }
    }

    pub fn to_move(&self) -> Side {
        shogi_core::moves::side_to_move(self.history.len())
    }

    pub fn seat_of(&self, session_id: u64) -> Option<Side> {
        if *self.players.get(Side::Sente) == Some(session_id) {
            Some(Side::Sente)
        } else if *self.players.get(Side::Gote) == Some(session_id) {
            Some(Side::Gote)
        } else {
            None
        }
    }

    pub fn role_of(&self, session_id: u64) -> Role {
        match self.seat_of(session_id) {
            Some(side) => side.into(),
            None => Role::Spectator,
        }
    }

    pub fn both_seats_online(&self) -> bool {
        self.players.get(Side::Sente).is_some() && self.players.get(Side::Gote).is_some()
    }

    /// Seat for a joining user: sticky user id first, then an empty seat
    /// preferring Sente, else spectator.
    pub fn assign_seat(&mut self, session_id: u64, user_id: &str, user_name: &str) -> Role {
        let seat = if self.user_ids.get(Side::Sente).as_deref() == Some(user_id) {
            Some(Side::Sente)
        } else if self.user_ids.get(Side::Gote).as_deref() == Some(user_id) {
            Some(Side::Gote)
        } else if self.user_ids.get(Side::Sente).is_none() {
            Some(Side::Sente)
        } else if self.user_ids.get(Side::Gote).is_none() {
            Some(Side::Gote)
        } else {
            None
        };

        match seat {
            Some(side) => {
                *self.players.get_mut(side) = Some(session_id);
                *self.user_ids.get_mut(side) = Some(user_id.to_string());
                *self.player_names.get_mut(side) = Some(user_name.to_string());
                side.into()
            }
            None => Role::Spectator,
        }
    }

    /// Restores the starting position, clearing history and counters.
    pub fn reset_position(&mut self) {
        self.board = initial_board();
        self.hands = Hands::empty();
        self.history.clear();
        self.sfen_history.clear();
        self.sfen_history
            .insert(position_key(&self.board, Side::Sente, &self.hands), 1);
        self.times = BySide::new(self.settings.initial_time, self.settings.initial_time);
        self.current_byoyomi = BySide::new(
            self.settings.byoyomi as i64,
            self.settings.byoyomi as i64,
        );
        self.total_consumed = BySide::default();
        self.winner = None;
    }
}

/// Shared application state.
pub struct AppState {
    pub db: SqlitePool,
    pub rooms: DashMap<String, Room>,
    pub connections: DashMap<u64, ConnectionHandle>,
    /// Running clock tasks, keyed by room id. Never persisted.
    pub timers: DashMap<String, JoinHandle<()>>,
    /// Single-writer snapshot queue; see the writer task in lib.rs.
    pub snapshots: mpsc::UnboundedSender<SnapshotCmd>,
    pub connection_count: AtomicU32,
    pub next_session_id: AtomicU64,
    pub next_message_id: AtomicU64,
    pub config: ServerConfig,
}

impl AppState {
    pub fn default_settings(&self) -> GameSettings {
        GameSettings::new(self.config.initial_time, self.config.byoyomi)
    }

    /// Live sessions currently in the given room.
    pub fn room_member_count(&self, room_id: &str) -> u32 {
        self.connections
            .iter()
            .filter(|conn| conn.room_id.as_deref() == Some(room_id))
            .count() as u32
    }

    /// Queues a snapshot of the room. Call while holding the room's
    /// write guard so the store sees states in mutation order.
    pub fn snapshot_room(&self, room: &Room) {
        match serde_json::to_string(room) {
            Ok(data) => {
                let _ = self.snapshots.send(SnapshotCmd::Save {
                    id: room.id.clone(),
                    data,
                    updated_at: now_ms() as i64,
                });
            }
            Err(err) => {
                tracing::error!(room_id = %room.id, %err, "failed to serialize room snapshot");
            }
        }
    }
}
