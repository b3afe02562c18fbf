//! Play-history ledger.

use crate::error::{Result, StorageError};
use listenledger_core::{ledger_timestamp, NewPlay, PlayId, PlayRecord, RecordOutcome, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// Inserts a play unless (user, track, played_at) is already recorded, in
/// which case the existing row id is returned as `ConflictIgnored`.
pub async fn record(pool: &SqlitePool, play: &NewPlay) -> Result<RecordOutcome> {
    let played_at = ledger_timestamp(play.played_at);

    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO play_history (user_id, track_id, played_at, source, listened_duration_ms)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(user_id, track_id, played_at) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(play.user_id)
    .bind(play.track_id)
    .bind(&played_at)
    .bind(play.source.as_str())
    .bind(play.listened_duration_ms.max(0))
    .fetch_optional(pool)
    .await?;

    if let Some(id) = inserted {
        return Ok(RecordOutcome::Recorded(id));
    }

    let existing: i64 = sqlx::query_scalar(
        "SELECT id FROM play_history WHERE user_id = ? AND track_id = ? AND played_at = ?",
    )
    .bind(play.user_id)
    .bind(play.track_id)
    .bind(&played_at)
    .fetch_one(pool)
    .await?;

    Ok(RecordOutcome::ConflictIgnored(existing))
}

pub async fn add_listened(pool: &SqlitePool, play_id: PlayId, delta_ms: i64) -> Result<()> {
    let result = sqlx::query(
        "UPDATE play_history SET listened_duration_ms = listened_duration_ms + ? WHERE id = ?",
    )
    .bind(delta_ms)
    .bind(play_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::not_found("play", play_id));
    }
    Ok(())
}

pub async fn get(pool: &SqlitePool, play_id: PlayId) -> Result<Option<PlayRecord>> {
    let row = sqlx::query(
        "SELECT id, user_id, track_id, played_at, source, listened_duration_ms \
         FROM play_history WHERE id = ?",
    )
    .bind(play_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| play_from_row(&r)).transpose()?)
}

pub async fn recent_for_user(
    pool: &SqlitePool,
    user_id: UserId,
    limit: u32,
) -> Result<Vec<PlayRecord>> {
    let rows = sqlx::query(
        "SELECT id, user_id, track_id, played_at, source, listened_duration_ms \
         FROM play_history WHERE user_id = ? ORDER BY played_at DESC, id DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| play_from_row(r).map_err(StorageError::from))
        .collect()
}

fn play_from_row(row: &SqliteRow) -> std::result::Result<PlayRecord, sqlx::Error> {
    Ok(PlayRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        track_id: row.try_get("track_id")?,
        played_at: row.try_get("played_at")?,
        source: row.try_get("source")?,
        listened_duration_ms: row.try_get("listened_duration_ms")?,
    })
}
