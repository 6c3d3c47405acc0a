use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use shogi_core::board::{Hands, Piece, PieceKind, Side, Square};
use shogi_core::moves::{Move, MoveTime, RecordedMove};
use shogi_core::protocol::{RoomMode, RoomStatus};
use shogi_server::state::{now_ms, AppState, Room};

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;
type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;

static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

fn fresh_db_url() -> String {
    let n = DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "sqlite:{}/shogi-test-{}-{}.db?mode=rwc",
        std::env::temp_dir().display(),
        std::process::id(),
        n
    )
}

/// Spin up a test server on a random port, return the base URL and state.
async fn start_server_with_db(db_url: &str) -> (String, Arc<AppState>) {
    let (app, state) = shogi_server::build_app(db_url).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{}", port), state)
}

async fn start_server() -> (String, Arc<AppState>) {
    start_server_with_db(&fresh_db_url()).await
}

async fn ws_connect(base: &str) -> (WsSink, WsStream) {
    let ws_url = base.replace("http://", "ws://");
    let url = format!("{}/ws", ws_url);
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    stream.split()
}

async fn ws_send(sink: &mut WsSink, msg: serde_json::Value) {
    sink.send(Message::Text(msg.to_string().into()))
        .await
        .unwrap();
}

/// Receive messages until we get one matching the expected type.
async fn ws_recv_type(stream: &mut WsStream, msg_type: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        if remaining.is_zero() {
            panic!("Timed out waiting for message type: {}", msg_type);
        }
        let msg = tokio::time::timeout(remaining, stream.next())
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for {}", msg_type))
            .unwrap()
            .unwrap();

        if let Message::Text(text) = msg {
            let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
            if parsed["type"].as_str() == Some(msg_type) {
                return parsed;
            }
        }
    }
}

/// Assert that no message of the given type arrives within the window.
async fn ws_expect_none(stream: &mut WsStream, msg_type: &str, window_ms: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(window_ms);
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        if remaining.is_zero() {
            return;
        }
        let msg = match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(msg))) => msg,
            _ => return,
        };
        if let Message::Text(text) = msg {
            let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
            if parsed["type"].as_str() == Some(msg_type) {
                panic!("Unexpected {} message: {}", msg_type, parsed);
            }
        }
    }
}

fn join_msg(room_id: &str, user_id: &str, user_name: &str) -> serde_json::Value {
    json!({
        "type": "join_room",
        "room_id": room_id,
        "user_id": user_id,
        "user_name": user_name,
    })
}

fn board_move_msg(room_id: &str, fx: usize, fy: usize, tx: usize, ty: usize) -> serde_json::Value {
    json!({
        "type": "move",
        "room_id": room_id,
        "move": {
            "type": "board",
            "from": { "x": fx, "y": fy },
            "to": { "x": tx, "y": ty },
            "promote": false,
        },
    })
}

/// Join two seated players and start a game with the given clock settings.
async fn start_game(
    base: &str,
    room_id: &str,
    initial_time: u64,
    byoyomi: u64,
) -> (WsSink, WsStream, WsSink, WsStream) {
    let (mut sink1, mut stream1) = ws_connect(base).await;
    let (mut sink2, mut stream2) = ws_connect(base).await;

    ws_send(&mut sink1, join_msg(room_id, "u1", "alice")).await;
    let sync = ws_recv_type(&mut stream1, "sync").await;
    assert_eq!(sync["your_role"], "sente");

    ws_send(&mut sink2, join_msg(room_id, "u2", "bob")).await;
    let sync = ws_recv_type(&mut stream2, "sync").await;
    assert_eq!(sync["your_role"], "gote");

    ws_send(
        &mut sink1,
        json!({
            "type": "update_settings",
            "room_id": room_id,
            "settings": {
                "initial_time": initial_time,
                "byoyomi": byoyomi,
                "random_turn": false,
                "fix_turn": false,
            },
        }),
    )
    .await;
    let _ = ws_recv_type(&mut stream2, "settings_updated").await;

    ws_send(&mut sink1, json!({"type": "toggle_ready", "room_id": room_id})).await;
    ws_send(&mut sink2, json!({"type": "toggle_ready", "room_id": room_id})).await;

    let _ = ws_recv_type(&mut stream1, "game_started").await;
    let _ = ws_recv_type(&mut stream2, "game_started").await;

    (sink1, stream1, sink2, stream2)
}

fn put(board: &mut shogi_core::Board, x: usize, y: usize, kind: PieceKind, side: Side) {
    board[y][x] = Some(Piece::new(kind, side));
}

/// Seed a mid-game room directly into server state, seats bound to the
/// given user ids so joining sessions pick them back up.
fn seed_playing_room(state: &Arc<AppState>, room: Room) {
    let id = room.id.clone();
    state.rooms.insert(id, room);
}

// ── Basics ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health() {
    let (base, _state) = start_server().await;
    let resp = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(resp, "ok");
}

#[tokio::test]
async fn test_seating_order_and_spectator() {
    let (base, _state) = start_server().await;

    let (mut sink1, mut stream1) = ws_connect(&base).await;
    ws_send(&mut sink1, join_msg("seats", "u1", "alice")).await;
    let sync = ws_recv_type(&mut stream1, "sync").await;
    assert_eq!(sync["your_role"], "sente");
    assert_eq!(sync["status"], "waiting");

    let (mut sink2, mut stream2) = ws_connect(&base).await;
    ws_send(&mut sink2, join_msg("seats", "u2", "bob")).await;
    let sync = ws_recv_type(&mut stream2, "sync").await;
    assert_eq!(sync["your_role"], "gote");

    let (mut sink3, mut stream3) = ws_connect(&base).await;
    ws_send(&mut sink3, join_msg("seats", "u3", "carol")).await;
    let sync = ws_recv_type(&mut stream3, "sync").await;
    assert_eq!(sync["your_role"], "spectator");

    let names = ws_recv_type(&mut stream3, "player_names_updated").await;
    assert_eq!(names["player_names"]["sente"], "alice");
    assert_eq!(names["player_names"]["gote"], "bob");

    let count = ws_recv_type(&mut stream3, "update_room_count").await;
    assert_eq!(count["count"], 3);
}

#[tokio::test]
async fn test_seat_is_sticky_for_a_user_id() {
    let (base, _state) = start_server().await;

    let (mut sink1, mut stream1) = ws_connect(&base).await;
    ws_send(&mut sink1, join_msg("sticky", "u1", "alice")).await;
    let _ = ws_recv_type(&mut stream1, "sync").await;

    let (mut sink2, mut stream2) = ws_connect(&base).await;
    ws_send(&mut sink2, join_msg("sticky", "u2", "bob")).await;
    let _ = ws_recv_type(&mut stream2, "sync").await;

    // Bob drops and comes back; same seat.
    drop(sink2);
    drop(stream2);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut sink3, mut stream3) = ws_connect(&base).await;
    ws_send(&mut sink3, join_msg("sticky", "u2", "bob")).await;
    let sync = ws_recv_type(&mut stream3, "sync").await;
    assert_eq!(sync["your_role"], "gote");
}

#[tokio::test]
async fn test_move_broadcast_and_turn_order() {
    let (base, _state) = start_server().await;
    let (mut sink1, mut stream1, _sink2, mut stream2) =
        start_game(&base, "moves", 600, 30).await;

    // Gote cannot move first; sente trying gote's piece is also dropped.
    ws_send(&mut sink1, board_move_msg("moves", 2, 2, 2, 3)).await;
    ws_expect_none(&mut stream1, "move", 300).await;

    ws_send(&mut sink1, board_move_msg("moves", 2, 6, 2, 5)).await;
    let mv = ws_recv_type(&mut stream1, "move").await;
    assert_eq!(mv["move"]["type"], "board");
    assert_eq!(mv["is_check"], false);

    let mv = ws_recv_type(&mut stream2, "move").await;
    assert_eq!(mv["move"]["from"]["x"], 2);
    assert_eq!(mv["move"]["from"]["y"], 6);
}

#[tokio::test]
async fn test_settings_are_rejected_while_playing() {
    let (base, _state) = start_server().await;
    let (mut sink1, mut stream1, _sink2, _stream2) =
        start_game(&base, "lockset", 600, 30).await;

    ws_send(
        &mut sink1,
        json!({
            "type": "update_settings",
            "room_id": "lockset",
            "settings": {
                "initial_time": 1,
                "byoyomi": 1,
                "random_turn": false,
                "fix_turn": false,
            },
        }),
    )
    .await;
    ws_expect_none(&mut stream1, "settings_updated", 300).await;
}

#[tokio::test]
async fn test_resign_finishes_the_game() {
    let (base, _state) = start_server().await;
    let (mut sink1, mut stream1, _sink2, mut stream2) =
        start_game(&base, "resign1", 600, 30).await;

    ws_send(&mut sink1, json!({"type": "game_resign", "room_id": "resign1"})).await;

    let finished = ws_recv_type(&mut stream1, "game_finished").await;
    assert_eq!(finished["reason"], "resign");
    assert_eq!(finished["winner"], "gote");
    let finished = ws_recv_type(&mut stream2, "game_finished").await;
    assert_eq!(finished["winner"], "gote");
}

#[tokio::test]
async fn test_rematch_returns_to_waiting() {
    let (base, _state) = start_server().await;
    let (mut sink1, mut stream1, mut sink2, mut stream2) =
        start_game(&base, "rematch1", 600, 30).await;

    ws_send(&mut sink1, json!({"type": "game_resign", "room_id": "rematch1"})).await;
    let _ = ws_recv_type(&mut stream1, "game_finished").await;
    let _ = ws_recv_type(&mut stream2, "game_finished").await;

    ws_send(&mut sink1, json!({"type": "rematch", "room_id": "rematch1"})).await;
    let status = ws_recv_type(&mut stream2, "rematch_status").await;
    assert_eq!(status["rematch_requests"]["sente"], true);
    assert_eq!(status["rematch_requests"]["gote"], false);

    ws_send(&mut sink2, json!({"type": "rematch", "room_id": "rematch1"})).await;
    let sync = ws_recv_type(&mut stream1, "sync").await;
    assert_eq!(sync["status"], "waiting");
    assert_eq!(sync["history"].as_array().unwrap().len(), 0);
    assert_eq!(sync["ready"]["sente"], false);
}

#[tokio::test]
async fn test_undo_is_gated_on_not_playing() {
    let (base, _state) = start_server().await;
    let (mut sink1, mut stream1, _sink2, mut stream2) =
        start_game(&base, "undo1", 600, 30).await;

    ws_send(&mut sink1, board_move_msg("undo1", 2, 6, 2, 5)).await;
    let _ = ws_recv_type(&mut stream1, "move").await;

    // Rejected mid-game.
    ws_send(&mut sink1, json!({"type": "undo", "room_id": "undo1"})).await;
    ws_expect_none(&mut stream1, "sync", 300).await;

    ws_send(&mut sink1, json!({"type": "game_resign", "room_id": "undo1"})).await;
    let _ = ws_recv_type(&mut stream2, "game_finished").await;

    ws_send(&mut sink1, json!({"type": "undo", "room_id": "undo1"})).await;
    let sync = ws_recv_type(&mut stream1, "sync").await;
    assert_eq!(sync["history"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_chat_fans_out_with_role() {
    let (base, _state) = start_server().await;

    let (mut sink1, mut stream1) = ws_connect(&base).await;
    ws_send(&mut sink1, join_msg("chat1", "u1", "alice")).await;
    let _ = ws_recv_type(&mut stream1, "sync").await;

    let (mut sink2, mut stream2) = ws_connect(&base).await;
    ws_send(&mut sink2, join_msg("chat1", "u2", "bob")).await;
    let _ = ws_recv_type(&mut stream2, "sync").await;

    ws_send(
        &mut sink1,
        json!({"type": "send_message", "room_id": "chat1", "text": "yoroshiku"}),
    )
    .await;
    let msg = ws_recv_type(&mut stream2, "receive_message").await;
    assert_eq!(msg["text"], "yoroshiku");
    assert_eq!(msg["role"], "sente");
    assert_eq!(msg["user_name"], "alice");
}

// ── Scenario 1: mate in one ─────────────────────────────────────────────

#[tokio::test]
async fn test_checkmate_ends_the_game() {
    let (base, state) = start_server().await;

    // Gote to move; G-47 is mate, the gold backed by the rook behind it.
    let mut room = Room::new(
        "mate1".into(),
        RoomMode::Play,
        shogi_core::protocol::GameSettings::new(600, 30),
    );
    room.status = RoomStatus::Playing;
    room.board = [[None; 9]; 9];
    put(&mut room.board, 4, 8, PieceKind::King, Side::Sente);
    put(&mut room.board, 7, 5, PieceKind::Pawn, Side::Sente);
    put(&mut room.board, 4, 6, PieceKind::Gold, Side::Gote);
    put(&mut room.board, 4, 4, PieceKind::Rook, Side::Gote);
    put(&mut room.board, 0, 0, PieceKind::King, Side::Gote);
    room.history.push(RecordedMove {
        mv: Move::Board {
            from: Square::new(7, 6),
            to: Square::new(7, 5),
            promote: false,
        },
        is_check: false,
        time: MoveTime::default(),
    });
    room.user_ids.sente = Some("u1".into());
    room.user_ids.gote = Some("u2".into());
    room.last_move_at = now_ms();
    seed_playing_room(&state, room);

    let (mut sink1, mut stream1) = ws_connect(&base).await;
    ws_send(&mut sink1, join_msg("mate1", "u1", "alice")).await;
    let _ = ws_recv_type(&mut stream1, "sync").await;
    let (mut sink2, mut stream2) = ws_connect(&base).await;
    ws_send(&mut sink2, join_msg("mate1", "u2", "bob")).await;
    let sync = ws_recv_type(&mut stream2, "sync").await;
    assert_eq!(sync["your_role"], "gote");
    assert_eq!(sync["status"], "playing");

    ws_send(&mut sink2, board_move_msg("mate1", 4, 6, 4, 7)).await;

    // The move broadcast precedes the terminal event.
    let mv = ws_recv_type(&mut stream1, "move").await;
    assert_eq!(mv["is_check"], true);
    let finished = ws_recv_type(&mut stream1, "game_finished").await;
    assert_eq!(finished["reason"], "checkmate");
    assert_eq!(finished["winner"], "gote");

    // Exactly one terminal event.
    ws_expect_none(&mut stream1, "game_finished", 300).await;
}

// ── Scenario 2: drop-pawn mate rejected ─────────────────────────────────

#[tokio::test]
async fn test_drop_pawn_mate_is_silently_rejected() {
    let (base, state) = start_server().await;

    let mut room = Room::new(
        "ufz".into(),
        RoomMode::Play,
        shogi_core::protocol::GameSettings::new(600, 30),
    );
    room.status = RoomStatus::Playing;
    room.board = [[None; 9]; 9];
    put(&mut room.board, 4, 1, PieceKind::King, Side::Gote);
    put(&mut room.board, 3, 0, PieceKind::Lance, Side::Gote);
    put(&mut room.board, 4, 0, PieceKind::Gold, Side::Gote);
    put(&mut room.board, 5, 0, PieceKind::Lance, Side::Gote);
    put(&mut room.board, 3, 1, PieceKind::Pawn, Side::Gote);
    put(&mut room.board, 5, 1, PieceKind::Pawn, Side::Gote);
    put(&mut room.board, 3, 2, PieceKind::Silver, Side::Gote);
    put(&mut room.board, 5, 2, PieceKind::Silver, Side::Gote);
    put(&mut room.board, 4, 6, PieceKind::Rook, Side::Sente);
    put(&mut room.board, 8, 8, PieceKind::King, Side::Sente);
    room.hands = Hands::empty();
    room.hands.add(Side::Sente, PieceKind::Pawn);
    room.user_ids.sente = Some("u1".into());
    room.user_ids.gote = Some("u2".into());
    room.last_move_at = now_ms();
    seed_playing_room(&state, room);

    let (mut sink1, mut stream1) = ws_connect(&base).await;
    ws_send(&mut sink1, join_msg("ufz", "u1", "alice")).await;
    let _ = ws_recv_type(&mut stream1, "sync").await;
    let (mut sink2, mut stream2) = ws_connect(&base).await;
    ws_send(&mut sink2, join_msg("ufz", "u2", "bob")).await;
    let _ = ws_recv_type(&mut stream2, "sync").await;

    ws_send(
        &mut sink1,
        json!({
            "type": "move",
            "room_id": "ufz",
            "move": {
                "type": "drop",
                "to": { "x": 4, "y": 2 },
                "piece": "pawn",
            },
        }),
    )
    .await;

    // No move event, no state change: it is still sente's turn.
    ws_expect_none(&mut stream1, "move", 400).await;

    ws_send(&mut sink1, board_move_msg("ufz", 4, 6, 4, 5)).await;
    let mv = ws_recv_type(&mut stream2, "move").await;
    assert_eq!(mv["move"]["from"]["y"], 6);
}

// ── Scenario 3: timeout ─────────────────────────────────────────────────

#[tokio::test]
async fn test_timeout_loses_for_the_idle_side() {
    let (base, _state) = start_server().await;
    let (_sink1, mut stream1, _sink2, mut stream2) =
        start_game(&base, "flag", 1, 2).await;

    // Sente never moves: 1s main + 2s byoyomi and the flag falls.
    let update = ws_recv_type(&mut stream1, "time_update").await;
    assert!(update["times"]["sente"].as_u64().unwrap() <= 1);

    let finished = ws_recv_type(&mut stream1, "game_finished").await;
    assert_eq!(finished["reason"], "timeout");
    assert_eq!(finished["winner"], "gote");
    let finished = ws_recv_type(&mut stream2, "game_finished").await;
    assert_eq!(finished["reason"], "timeout");
}

// ── Scenario 4: perpetual check ─────────────────────────────────────────

#[tokio::test]
async fn test_perpetual_check_loses_for_the_checker() {
    let (base, state) = start_server().await;

    let mut room = Room::new(
        "perp".into(),
        RoomMode::Play,
        shogi_core::protocol::GameSettings::new(600, 30),
    );
    room.status = RoomStatus::Playing;
    room.board = [[None; 9]; 9];
    put(&mut room.board, 4, 0, PieceKind::King, Side::Gote);
    put(&mut room.board, 8, 4, PieceKind::Rook, Side::Sente);
    put(&mut room.board, 0, 8, PieceKind::King, Side::Sente);
    room.user_ids.sente = Some("u1".into());
    room.user_ids.gote = Some("u2".into());
    room.last_move_at = now_ms();
    seed_playing_room(&state, room);

    let (mut sink1, mut stream1) = ws_connect(&base).await;
    ws_send(&mut sink1, join_msg("perp", "u1", "alice")).await;
    let _ = ws_recv_type(&mut stream1, "sync").await;
    let (mut sink2, mut stream2) = ws_connect(&base).await;
    ws_send(&mut sink2, join_msg("perp", "u2", "bob")).await;
    let _ = ws_recv_type(&mut stream2, "sync").await;

    // Rook checks from 8,0 / 8,1 while the king shuffles 4,0 <-> 4,1; the
    // checked position repeats until its fourth occurrence.
    let sente_moves = [
        (8usize, 4usize, 8usize, 0usize),
        (8, 0, 8, 1),
        (8, 1, 8, 0),
        (8, 0, 8, 1),
        (8, 1, 8, 0),
        (8, 0, 8, 1),
        (8, 1, 8, 0),
    ];
    let gote_moves = [
        (4usize, 0usize, 4usize, 1usize),
        (4, 1, 4, 0),
        (4, 0, 4, 1),
        (4, 1, 4, 0),
        (4, 0, 4, 1),
        (4, 1, 4, 0),
    ];

    for i in 0..13 {
        if i % 2 == 0 {
            let (fx, fy, tx, ty) = sente_moves[i / 2];
            ws_send(&mut sink1, board_move_msg("perp", fx, fy, tx, ty)).await;
        } else {
            let (fx, fy, tx, ty) = gote_moves[i / 2];
            ws_send(&mut sink2, board_move_msg("perp", fx, fy, tx, ty)).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    let finished = ws_recv_type(&mut stream1, "game_finished").await;
    assert_eq!(finished["reason"], "illegal_sennichite");
    assert_eq!(finished["winner"], "gote");
}

// ── Scenario 5: sennichite draw ─────────────────────────────────────────

#[tokio::test]
async fn test_fourfold_repetition_without_checks_is_a_draw() {
    let (base, _state) = start_server().await;
    let (mut sink1, mut stream1, mut sink2, _stream2) =
        start_game(&base, "draw1", 600, 30).await;

    // Both golds shuffle; the starting position comes back every four
    // moves and the game start itself counts as the first occurrence.
    for _ in 0..3 {
        for (sente_turn, mv) in [
            (true, (3usize, 8usize, 3usize, 7usize)),
            (false, (3, 0, 3, 1)),
            (true, (3, 7, 3, 8)),
            (false, (3, 1, 3, 0)),
        ] {
            let (fx, fy, tx, ty) = mv;
            let sink = if sente_turn { &mut sink1 } else { &mut sink2 };
            ws_send(sink, board_move_msg("draw1", fx, fy, tx, ty)).await;
            tokio::time::sleep(Duration::from_millis(80)).await;
        }
    }

    let finished = ws_recv_type(&mut stream1, "game_finished").await;
    assert_eq!(finished["reason"], "sennichite");
    assert!(finished["winner"].is_null());
}

// ── Scenario 6: disconnect pauses, reconnect resumes ────────────────────

#[tokio::test]
async fn test_reconnect_resumes_the_clock_from_committed_time() {
    let (base, _state) = start_server().await;
    let (sink1, stream1, _sink2, mut stream2) =
        start_game(&base, "resume", 600, 30).await;

    // Let sente burn about two seconds, then vanish.
    tokio::time::sleep(Duration::from_millis(2100)).await;
    drop(sink1);
    drop(stream1);

    let status = ws_recv_type(&mut stream2, "connection_status_update").await;
    assert_eq!(status["sente"], false);

    // Paused: no clock broadcasts while a seat is empty.
    tokio::time::sleep(Duration::from_millis(500)).await;
    while let Ok(Some(_)) =
        tokio::time::timeout(Duration::from_millis(50), stream2.next()).await
    {}
    ws_expect_none(&mut stream2, "time_update", 1500).await;

    // Stay away past the committed remainder, then come back.
    tokio::time::sleep(Duration::from_millis(2000)).await;
    let (mut sink3, mut stream3) = ws_connect(&base).await;
    ws_send(&mut sink3, join_msg("resume", "u1", "alice")).await;
    let sync = ws_recv_type(&mut stream3, "sync").await;
    assert_eq!(sync["your_role"], "sente");
    let committed = sync["times"]["sente"].as_u64().unwrap();
    assert!((597..=599).contains(&committed), "committed {committed}");

    // The clock resumes from the committed value, not wall time away.
    let update = ws_recv_type(&mut stream3, "time_update").await;
    let shown = update["times"]["sente"].as_u64().unwrap();
    assert!(shown + 1 >= committed && shown <= committed, "shown {shown}");
}

// ── Snapshot round-trip ─────────────────────────────────────────────────

#[tokio::test]
async fn test_rooms_survive_a_restart() {
    let db_url = fresh_db_url();
    let (base, _state) = start_server_with_db(&db_url).await;

    let (mut sink1, mut stream1, _sink2, _stream2) =
        start_game(&base, "persist1", 600, 30).await;
    ws_send(&mut sink1, board_move_msg("persist1", 2, 6, 2, 5)).await;
    let _ = ws_recv_type(&mut stream1, "move").await;

    // Let the snapshot writer drain, then boot a second server instance
    // over the same store.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (base2, state2) = start_server_with_db(&db_url).await;

    {
        let room = state2.rooms.get("persist1").expect("room restored");
        assert_eq!(room.status, RoomStatus::Playing);
        assert_eq!(room.history.len(), 1);
        // Timers stay unstarted after a reload.
        assert!(!state2.timers.contains_key("persist1"));
    }

    let (mut sink3, mut stream3) = ws_connect(&base2).await;
    ws_send(&mut sink3, join_msg("persist1", "u1", "alice")).await;
    let sync = ws_recv_type(&mut stream3, "sync").await;
    assert_eq!(sync["your_role"], "sente");
    assert_eq!(sync["status"], "playing");
    assert_eq!(sync["history"].as_array().unwrap().len(), 1);
    assert_eq!(sync["player_names"]["gote"], "bob");
}

// ── Analysis mode ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_analysis_branching_truncates_and_replays() {
    let (base, _state) = start_server().await;

    let (mut sink1, mut stream1) = ws_connect(&base).await;
    ws_send(
        &mut sink1,
        json!({
            "type": "join_room",
            "room_id": "study",
            "mode": "analysis",
            "user_id": "u1",
            "user_name": "alice",
        }),
    )
    .await;
    let sync = ws_recv_type(&mut stream1, "sync").await;
    assert_eq!(sync["status"], "analysis");

    ws_send(&mut sink1, board_move_msg("study", 2, 6, 2, 5)).await;
    let sync = ws_recv_type(&mut stream1, "sync").await;
    assert_eq!(sync["history"].as_array().unwrap().len(), 1);

    ws_send(&mut sink1, board_move_msg("study", 2, 2, 2, 3)).await;
    let sync = ws_recv_type(&mut stream1, "sync").await;
    assert_eq!(sync["history"].as_array().unwrap().len(), 2);

    // Branch from the start: history rewinds to the prefix, then the new
    // first move lands.
    ws_send(
        &mut sink1,
        json!({
            "type": "move",
            "room_id": "study",
            "branch_index": 0,
            "move": {
                "type": "board",
                "from": { "x": 6, "y": 6 },
                "to": { "x": 6, "y": 5 },
                "promote": false,
            },
        }),
    )
    .await;
    let sync = ws_recv_type(&mut stream1, "sync").await;
    let history = sync["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["from"]["x"], 6);
}
