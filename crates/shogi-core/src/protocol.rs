use serde::{Deserialize, Serialize};

use crate::board::{BySide, Side};
use crate::moves::{Move, MoveTime, RecordedMove};

/// Room lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Finished,
    Analysis,
}

/// What a session is in a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sente,
    Gote,
    Spectator,
}

impl Role {
    pub fn side(&self) -> Option<Side> {
        match self {
            Role::Sente => Some(Side::Sente),
            Role::Gote => Some(Side::Gote),
            Role::Spectator => None,
        }
    }
}

impl From<Side> for Role {
    fn from(side: Side) -> Role {
        match side {
            Side::Sente => Role::Sente,
            Side::Gote => Role::Gote,
        }
    }
}

/// Why a game ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Resign,
    Timeout,
    Sennichite,
    IllegalSennichite,
    Checkmate,
}

/// Room mode chosen at creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomMode {
    #[default]
    Play,
    Analysis,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSettings {
    /// Main time per player, seconds.
    pub initial_time: u64,
    /// Per-move countdown once main time is gone, seconds.
    pub byoyomi: u64,
    pub random_turn: bool,
    pub fix_turn: bool,
}

impl GameSettings {
    pub fn new(initial_time: u64, byoyomi: u64) -> GameSettings {
        GameSettings {
            initial_time,
            byoyomi,
            random_turn: false,
            fix_turn: false,
        }
    }
}

/// Messages sent from client to server
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        #[serde(default)]
        mode: RoomMode,
        user_id: String,
        user_name: String,
    },
    SendMessage {
        room_id: String,
        text: String,
    },
    UpdateSettings {
        room_id: String,
        settings: GameSettings,
    },
    ToggleReady {
        room_id: String,
    },
    Move {
        room_id: String,
        #[serde(rename = "move")]
        game_move: Move,
        #[serde(default)]
        branch_index: Option<usize>,
    },
    GameResign {
        room_id: String,
    },
    Undo {
        room_id: String,
    },
    Reset {
        room_id: String,
    },
    Rematch {
        room_id: String,
    },
    PingLatency,
}

/// Messages sent from server to client
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full authoritative room state, sent per session.
    Sync {
        history: Vec<RecordedMove>,
        status: RoomStatus,
        winner: Option<Side>,
        your_role: Role,
        ready: BySide<bool>,
        settings: GameSettings,
        times: BySide<u64>,
        rematch_requests: BySide<bool>,
        player_names: BySide<Option<String>>,
    },
    Move {
        #[serde(rename = "move")]
        game_move: Move,
        is_check: bool,
        time: MoveTime,
    },
    TimeUpdate {
        times: BySide<u64>,
        current_byoyomi: BySide<i64>,
    },
    GameStarted,
    GameFinished {
        winner: Option<Side>,
        reason: FinishReason,
    },
    SettingsUpdated {
        settings: GameSettings,
    },
    ReadyStatus {
        ready: BySide<bool>,
    },
    RematchStatus {
        rematch_requests: BySide<bool>,
    },
    PlayerNamesUpdated {
        player_names: BySide<Option<String>>,
    },
    ConnectionStatusUpdate {
        sente: bool,
        gote: bool,
    },
    UpdateGlobalCount {
        count: u32,
    },
    UpdateRoomCount {
        count: u32,
    },
    ReceiveMessage {
        id: u64,
        text: String,
        role: Role,
        user_name: String,
        user_id: String,
        timestamp: u64,
    },
}
