//! Track catalog: vendor-id keyed upsert with a configurable merge policy.

use crate::error::Result;
use listenledger_core::{MergePolicy, StoredTrack, TrackColumn, TrackFields, TrackId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

const TRACK_COLUMNS: &str = "id, vendor_id, title, artist, album, duration_ms, image_url, year, \
     genre, bitrate, codec, track_number, disc_number, raw_data, created_at";

/// Builds the single-statement upsert for `policy`.
///
/// Volatile columns take the incoming value unless it is null; all other
/// columns keep the stored value unless that is null. Either way a null never
/// replaces a known value.
pub fn upsert_statement(policy: &MergePolicy) -> String {
    let columns = TrackColumn::ALL
        .iter()
        .map(|c| c.column_name())
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; TrackColumn::ALL.len() + 1].join(", ");
    let assignments = TrackColumn::ALL
        .iter()
        .map(|c| {
            let name = c.column_name();
            if policy.is_volatile(*c) {
                format!("{name} = COALESCE(excluded.{name}, tracks.{name})")
            } else {
                format!("{name} = COALESCE(tracks.{name}, excluded.{name})")
            }
        })
        .collect::<Vec<_>>()
        .join(",\n            ");

    format!(
        r#"
        INSERT INTO tracks (vendor_id, {columns})
        VALUES ({placeholders})
        ON CONFLICT(vendor_id) DO UPDATE SET
            {assignments},
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        RETURNING id
        "#
    )
}

pub async fn upsert(pool: &SqlitePool, statement: &str, fields: &TrackFields) -> Result<TrackId> {
    let mut query = sqlx::query_scalar::<sqlx::Sqlite, i64>(statement).bind(&fields.vendor_id);
    for column in TrackColumn::ALL {
        query = match column {
            TrackColumn::Title => query.bind(&fields.title),
            TrackColumn::Artist => query.bind(&fields.artist),
            TrackColumn::Album => query.bind(&fields.album),
            TrackColumn::DurationMs => query.bind(fields.duration_ms),
            TrackColumn::ImageUrl => query.bind(&fields.image_url),
            TrackColumn::Year => query.bind(fields.year),
            TrackColumn::Genre => query.bind(&fields.genre),
            TrackColumn::Bitrate => query.bind(fields.bitrate),
            TrackColumn::Codec => query.bind(&fields.codec),
            TrackColumn::TrackNumber => query.bind(fields.track_number),
            TrackColumn::DiscNumber => query.bind(fields.disc_number),
            TrackColumn::RawData => query.bind(&fields.raw_data),
        };
    }

    Ok(query.fetch_one(pool).await?)
}

pub async fn get_by_id(pool: &SqlitePool, id: TrackId) -> Result<Option<StoredTrack>> {
    let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row.map(|r| track_from_row(&r)).transpose()?)
}

pub async fn get_by_vendor_id(pool: &SqlitePool, vendor_id: &str) -> Result<Option<StoredTrack>> {
    let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE vendor_id = ?");
    let row = sqlx::query(&sql)
        .bind(vendor_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| track_from_row(&r)).transpose()?)
}

/// Latest-updated track matching artist and title, case-insensitively.
pub async fn find_by_artist_title(
    pool: &SqlitePool,
    artist: &str,
    title: &str,
) -> Result<Option<StoredTrack>> {
    let sql = format!(
        "SELECT {TRACK_COLUMNS} FROM tracks \
         WHERE artist = ? COLLATE NOCASE AND title = ? COLLATE NOCASE \
         ORDER BY updated_at DESC, id DESC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(artist)
        .bind(title)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| track_from_row(&r)).transpose()?)
}

fn track_from_row(row: &SqliteRow) -> std::result::Result<StoredTrack, sqlx::Error> {
    Ok(StoredTrack {
        id: row.try_get("id")?,
        fields: TrackFields {
            vendor_id: row.try_get("vendor_id")?,
            title: row.try_get("title")?,
            artist: row.try_get("artist")?,
            album: row.try_get("album")?,
            duration_ms: row.try_get("duration_ms")?,
            image_url: row.try_get("image_url")?,
            year: row.try_get("year")?,
            genre: row.try_get("genre")?,
            bitrate: row.try_get("bitrate")?,
            codec: row.try_get("codec")?,
            track_number: row.try_get("track_number")?,
            disc_number: row.try_get("disc_number")?,
            raw_data: row.try_get("raw_data")?,
        },
        created_at: row.try_get("created_at")?,
    })
}
