//! Seams between the reconciliation engine and the system of record.

use crate::error::StoreError;
use crate::model::{
    NewPlay, PlayId, PlayRecord, RecordOutcome, SpotifyLink, StoredTrack, SubsonicTarget,
    TrackFields, TrackId, User, UserId,
};
use async_trait::async_trait;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Deduplicated track catalog keyed by vendor id.
#[async_trait]
pub trait TrackCatalog: Send + Sync {
    /// Inserts or merges `fields` and returns the stable track id.
    ///
    /// Must be a single atomic statement so that the poll and push paths can
    /// touch the same vendor id concurrently without losing an update.
    async fn upsert(&self, fields: &TrackFields) -> StoreResult<TrackId>;

    async fn get_track(&self, id: TrackId) -> StoreResult<Option<StoredTrack>>;

    async fn get_track_by_vendor_id(&self, vendor_id: &str) -> StoreResult<Option<StoredTrack>>;

    /// Most recent sighting of an (artist, title) pair from any source.
    async fn find_by_artist_title(
        &self,
        artist: &str,
        title: &str,
    ) -> StoreResult<Option<StoredTrack>>;
}

/// Append-mostly play history with (user, track, played_at) uniqueness.
#[async_trait]
pub trait PlayLedger: Send + Sync {
    async fn record_play(&self, play: &NewPlay) -> StoreResult<RecordOutcome>;

    async fn add_listened(&self, play_id: PlayId, delta_ms: i64) -> StoreResult<()>;

    async fn get_play(&self, play_id: PlayId) -> StoreResult<Option<PlayRecord>>;

    async fn recent_plays(&self, user_id: UserId, limit: u32) -> StoreResult<Vec<PlayRecord>>;
}

/// Users and their linked remote accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn user_by_listen_token(&self, token: &str) -> StoreResult<Option<User>>;

    async fn subsonic_targets(&self) -> StoreResult<Vec<SubsonicTarget>>;

    async fn spotify_links(&self) -> StoreResult<Vec<SpotifyLink>>;

    /// Replaces the access token, and the refresh token when a new one was issued.
    async fn store_spotify_tokens(
        &self,
        user_id: UserId,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> StoreResult<()>;
}
