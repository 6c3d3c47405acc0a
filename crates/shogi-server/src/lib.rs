pub mod clock;
pub mod db;
pub mod game;
pub mod routes;
pub mod state;
pub mod ws;

use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::db::SnapshotCmd;
use crate::state::{now_ms, AppState, Room, ServerConfig};

/// Build a fully configured Router + shared state.
///
/// Reloads persisted rooms; their clocks stay unstarted until a join
/// sees both players online again.
pub async fn build_app(db_url: &str) -> (Router, Arc<AppState>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .expect("Failed to connect to SQLite");

    db::init_db(&pool)
        .await
        .expect("Failed to initialize database");

    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel::<SnapshotCmd>();

    let state = Arc::new(AppState {
        db: pool,
        rooms: DashMap::new(),
        connections: DashMap::new(),
        timers: DashMap::new(),
        snapshots: snapshot_tx,
        connection_count: AtomicU32::new(0),
        next_session_id: AtomicU64::new(1),
        next_message_id: AtomicU64::new(1),
        config: ServerConfig::default(),
    });

    restore_rooms(&state).await;

    // Single-writer snapshot task: the store sees each room's states in
    // the order mutations queued them.
    {
        let state = state.clone();
        let mut rx = snapshot_rx;
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let (room_id, result) = match &cmd {
                    SnapshotCmd::Save {
                        id,
                        data,
                        updated_at,
                    } => (id.clone(), db::save_room(&state.db, id, data, *updated_at).await),
                    SnapshotCmd::Delete { id } => {
                        (id.clone(), db::delete_room(&state.db, id).await)
                    }
                };
                if let Err(err) = result {
                    // In-memory state is not rolled back on a failed save.
                    tracing::error!(%room_id, %err, "room snapshot write failed");
                }
            }
        });
    }

    // Hourly GC of rooms that are both stale and empty.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(state.config.gc_interval_secs));
            loop {
                interval.tick().await;
                gc_rooms(&state).await;
            }
        });
    }

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/ws", get(routes::ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    (app, state)
}

/// Repopulate the room map from snapshots. Session ids do not survive a
/// restart; seats stay sticky through `user_ids`.
async fn restore_rooms(state: &Arc<AppState>) {
    let rows = match db::load_rooms(&state.db).await {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!(%err, "failed to load room snapshots");
            return;
        }
    };

    let mut restored = 0u32;
    for (id, data) in rows {
        match serde_json::from_str::<Room>(&data) {
            Ok(mut room) => {
                room.players = Default::default();
                state.rooms.insert(id, room);
                restored += 1;
            }
            Err(err) => {
                tracing::warn!(room_id = %id, %err, "skipping unreadable room snapshot");
            }
        }
    }
    if restored > 0 {
        tracing::info!(restored, "rooms restored from store");
    }
}

/// Delete rooms inactive for longer than the threshold with no live
/// sessions, both from the store and from memory.
async fn gc_rooms(state: &Arc<AppState>) {
    let cutoff = now_ms() as i64 - state.config.room_stale_ms as i64;
    let stale = match db::stale_room_ids(&state.db, cutoff).await {
        Ok(ids) => ids,
        Err(err) => {
            tracing::error!(%err, "stale room query failed");
            return;
        }
    };

    for id in stale {
        if state.room_member_count(&id) > 0 {
            continue;
        }
        state.rooms.remove(&id);
        clock::stop(state, &id);
        if let Err(err) = db::delete_room(&state.db, &id).await {
            tracing::error!(room_id = %id, %err, "failed to delete stale room");
        } else {
            tracing::info!(room_id = %id, "stale room collected");
        }
    }
}
