use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = i64;
pub type ServerId = i64;
pub type TrackId = i64;
pub type PlayId = i64;

/// Which ingestion path produced a ledger row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Subsonic,
    Spotify,
    ListenBrainz,
    /// Generic JSON scrobble endpoint.
    Scrobble,
}

impl SourceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::Subsonic => "subsonic",
            SourceTag::Spotify => "spotify",
            SourceTag::ListenBrainz => "listenbrainz",
            SourceTag::Scrobble => "scrobble",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A partial track description as seen by one source.
///
/// `vendor_id`, `title` and `artist` are always known; everything else is
/// best-effort and merged into the catalog according to the merge policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrackFields {
    pub vendor_id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_ms: Option<i64>,
    pub image_url: Option<String>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    pub bitrate: Option<i32>,
    pub codec: Option<String>,
    pub track_number: Option<i32>,
    pub disc_number: Option<i32>,
    pub raw_data: Option<String>,
}

impl TrackFields {
    pub fn new(
        vendor_id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
    ) -> Self {
        Self {
            vendor_id: vendor_id.into(),
            title: title.into(),
            artist: artist.into(),
            ..Self::default()
        }
    }
}

/// A catalog row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredTrack {
    pub id: TrackId,
    #[serde(flatten)]
    pub fields: TrackFields,
    pub created_at: String,
}

/// One entry of a streaming server's "now playing" list, already narrowed to
/// the polled user.
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlayingEntry {
    pub track: TrackFields,
    /// The server's own "minutes since this play started" counter.
    pub minutes_ago: u32,
    pub player_name: Option<String>,
}

/// An item of an external API's recently-played history.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentPlay {
    pub track: TrackFields,
    pub played_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPlay {
    pub user_id: UserId,
    pub track_id: TrackId,
    pub played_at: DateTime<Utc>,
    pub source: SourceTag,
    pub listened_duration_ms: i64,
}

/// Result of a ledger insert. A collision on (user, track, played_at) is not
/// an error: the existing row id is handed back instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(PlayId),
    ConflictIgnored(PlayId),
}

impl RecordOutcome {
    pub fn play_id(self) -> PlayId {
        match self {
            RecordOutcome::Recorded(id) | RecordOutcome::ConflictIgnored(id) => id,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, RecordOutcome::Recorded(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayRecord {
    pub id: PlayId,
    pub user_id: UserId,
    pub track_id: TrackId,
    pub played_at: String,
    pub source: String,
    pub listened_duration_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

/// A (user, streaming server) pair the poller visits every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsonicTarget {
    pub user_id: UserId,
    pub server_id: ServerId,
    pub name: Option<String>,
    pub base_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotifyLink {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Ledger timestamps are stored as RFC 3339 UTC with millisecond precision so
/// that string equality matches instant equality for the uniqueness key.
pub fn ledger_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::{ledger_timestamp, RecordOutcome, SourceTag};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ledger_timestamp_is_millisecond_utc() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        assert_eq!(ledger_timestamp(at), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn record_outcome_keeps_id_on_conflict() {
        assert_eq!(RecordOutcome::ConflictIgnored(7).play_id(), 7);
        assert!(!RecordOutcome::ConflictIgnored(7).is_new());
        assert!(RecordOutcome::Recorded(3).is_new());
        assert_eq!(SourceTag::ListenBrainz.to_string(), "listenbrainz");
    }
}
