use sqlx::{Row, SqlitePool};

/// A queued write for the snapshot writer task.
#[derive(Debug)]
pub enum SnapshotCmd {
    Save {
        id: String,
        data: String,
        updated_at: i64,
    },
    Delete {
        id: String,
    },
}

/// Create the snapshot table and enable WAL.
pub async fn init_db(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rooms (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Upsert a room snapshot.
pub async fn save_room(
    pool: &SqlitePool,
    id: &str,
    data: &str,
    updated_at: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO rooms (id, data, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET data = ?2, updated_at = ?3",
    )
    .bind(id)
    .bind(data)
    .bind(updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_room(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM rooms WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// All stored snapshots as (id, data) pairs.
pub async fn load_rooms(pool: &SqlitePool) -> Result<Vec<(String, String)>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, data FROM rooms")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|r| (r.get::<String, _>("id"), r.get::<String, _>("data")))
        .collect())
}

/// Ids of rooms not updated since `cutoff` (ms epoch).
pub async fn stale_room_ids(
    pool: &SqlitePool,
    cutoff: i64,
) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query("SELECT id FROM rooms WHERE updated_at < ?1")
        .bind(cutoff)
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|r| r.get::<String, _>("id")).collect())
}
