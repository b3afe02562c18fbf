//! SQLite system of record for listenledger.
//!
//! Each table family lives in its own module with free functions over a
//! `&SqlitePool`. [`SqliteLedger`] wraps a pool and implements the
//! `listenledger-core` storage traits on top of those modules.
//!
//! ```rust,no_run
//! use listenledger_core::MergePolicy;
//! use listenledger_storage::SqliteLedger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = SqliteLedger::open("sqlite://listenledger.db", &MergePolicy::default()).await?;
//! let users = listenledger_storage::accounts::list_users(ledger.pool()).await?;
//! # Ok(())
//! # }
//! ```

mod error;

pub mod accounts;
pub mod catalog;
pub mod history;

pub use error::StorageError;

use async_trait::async_trait;
use listenledger_core::{
    AccountStore, MergePolicy, NewPlay, PlayId, PlayLedger, PlayRecord, RecordOutcome,
    SpotifyLink, StoreResult, StoredTrack, SubsonicTarget, TrackCatalog, TrackFields, TrackId,
    User, UserId,
};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

/// Opens a pool for `database_url`, creating the file if needed.
///
/// In-memory URLs get a single connection that never expires, since every
/// new connection would otherwise see an empty database.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    tracing::debug!(url = %database_url, "opening sqlite pool");

    let in_memory = database_url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        options = options.journal_mode(SqliteJournalMode::Wal);
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_options.connect_with(options).await?;
    tracing::debug!(in_memory, "sqlite pool ready");
    Ok(pool)
}

/// Pool-backed implementation of the catalog, ledger and account traits.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
    upsert_sql: String,
}

impl SqliteLedger {
    /// Wraps an already-migrated pool.
    pub fn new(pool: SqlitePool, policy: &MergePolicy) -> Self {
        Self {
            pool,
            upsert_sql: catalog::upsert_statement(policy),
        }
    }

    /// Connects and brings the schema up to date.
    pub async fn open(database_url: &str, policy: &MergePolicy) -> Result<Self, StorageError> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool, policy))
    }

    pub async fn in_memory(policy: &MergePolicy) -> Result<Self, StorageError> {
        Self::open("sqlite::memory:", policy).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TrackCatalog for SqliteLedger {
    async fn upsert(&self, fields: &TrackFields) -> StoreResult<TrackId> {
        Ok(catalog::upsert(&self.pool, &self.upsert_sql, fields).await?)
    }

    async fn get_track(&self, id: TrackId) -> StoreResult<Option<StoredTrack>> {
        Ok(catalog::get_by_id(&self.pool, id).await?)
    }

    async fn get_track_by_vendor_id(&self, vendor_id: &str) -> StoreResult<Option<StoredTrack>> {
        Ok(catalog::get_by_vendor_id(&self.pool, vendor_id).await?)
    }

    async fn find_by_artist_title(
        &self,
        artist: &str,
        title: &str,
    ) -> StoreResult<Option<StoredTrack>> {
        Ok(catalog::find_by_artist_title(&self.pool, artist, title).await?)
    }
}

#[async_trait]
impl PlayLedger for SqliteLedger {
    async fn record_play(&self, play: &NewPlay) -> StoreResult<RecordOutcome> {
        Ok(history::record(&self.pool, play).await?)
    }

    async fn add_listened(&self, play_id: PlayId, delta_ms: i64) -> StoreResult<()> {
        Ok(history::add_listened(&self.pool, play_id, delta_ms).await?)
    }

    async fn get_play(&self, play_id: PlayId) -> StoreResult<Option<PlayRecord>> {
        Ok(history::get(&self.pool, play_id).await?)
    }

    async fn recent_plays(&self, user_id: UserId, limit: u32) -> StoreResult<Vec<PlayRecord>> {
        Ok(history::recent_for_user(&self.pool, user_id, limit).await?)
    }
}

#[async_trait]
impl AccountStore for SqliteLedger {
    async fn user_by_listen_token(&self, token: &str) -> StoreResult<Option<User>> {
        Ok(accounts::user_by_listen_token(&self.pool, token).await?)
    }

    async fn subsonic_targets(&self) -> StoreResult<Vec<SubsonicTarget>> {
        Ok(accounts::subsonic_targets(&self.pool).await?)
    }

    async fn spotify_links(&self) -> StoreResult<Vec<SpotifyLink>> {
        Ok(accounts::spotify_links(&self.pool).await?)
    }

    async fn store_spotify_tokens(
        &self,
        user_id: UserId,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> StoreResult<()> {
        Ok(accounts::store_spotify_tokens(&self.pool, user_id, access_token, refresh_token).await?)
    }
}
