use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_schema_version() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://listenledger.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigIntervals {
    pub subsonic_poll_secs: u64,
    pub spotify_poll_secs: u64,
    pub initial_delay_secs: u64,
}

impl Default for ConfigIntervals {
    fn default() -> Self {
        Self {
            subsonic_poll_secs: 10,
            spotify_poll_secs: 300,
            initial_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound of one accumulation step, as a multiple of the poll interval.
    pub cap_multiplier: f64,
    /// How far past the track's end a "minutes ago" counter may run before
    /// the entry is considered a leftover.
    pub stale_grace_minutes: u32,
    /// Consecutive failed polls after which a server counts as unreachable.
    pub max_consecutive_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cap_multiplier: 2.5,
            stale_grace_minutes: 5,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_in_flight: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_in_flight: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub now_playing_ttl_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            now_playing_ttl_secs: 600,
        }
    }
}

/// Catalog columns that take part in metadata merging.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackColumn {
    Title,
    Artist,
    Album,
    DurationMs,
    ImageUrl,
    Year,
    Genre,
    Bitrate,
    Codec,
    TrackNumber,
    DiscNumber,
    RawData,
}

impl TrackColumn {
    pub const ALL: [TrackColumn; 12] = [
        TrackColumn::Title,
        TrackColumn::Artist,
        TrackColumn::Album,
        TrackColumn::DurationMs,
        TrackColumn::ImageUrl,
        TrackColumn::Year,
        TrackColumn::Genre,
        TrackColumn::Bitrate,
        TrackColumn::Codec,
        TrackColumn::TrackNumber,
        TrackColumn::DiscNumber,
        TrackColumn::RawData,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            TrackColumn::Title => "title",
            TrackColumn::Artist => "artist",
            TrackColumn::Album => "album",
            TrackColumn::DurationMs => "duration_ms",
            TrackColumn::ImageUrl => "image_url",
            TrackColumn::Year => "year",
            TrackColumn::Genre => "genre",
            TrackColumn::Bitrate => "bitrate",
            TrackColumn::Codec => "codec",
            TrackColumn::TrackNumber => "track_number",
            TrackColumn::DiscNumber => "disc_number",
            TrackColumn::RawData => "raw_data",
        }
    }
}

/// Which catalog columns follow the latest sighting. Every other column is
/// only filled while it is still null.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MergePolicy {
    pub volatile_fields: Vec<TrackColumn>,
}

impl MergePolicy {
    pub fn is_volatile(&self, column: TrackColumn) -> bool {
        self.volatile_fields.contains(&column)
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            volatile_fields: vec![TrackColumn::Title, TrackColumn::ImageUrl, TrackColumn::RawData],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsonicConfig {
    pub client_name: String,
    pub api_version: String,
    pub timeout_ms: u64,
    /// Servers whose URL contains one of these are never polled; their plays
    /// arrive through push ingestion instead.
    pub scrobble_only_hosts: Vec<String>,
}

impl Default for SubsonicConfig {
    fn default() -> Self {
        Self {
            client_name: "listenledger".to_string(),
            api_version: "1.16.1".to_string(),
            timeout_ms: 10_000,
            scrobble_only_hosts: Vec::new(),
        }
    }
}

impl SubsonicConfig {
    pub fn is_scrobble_only(&self, url: &str) -> bool {
        self.scrobble_only_hosts
            .iter()
            .any(|host| !host.trim().is_empty() && url.contains(host.trim()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    pub accounts_base: String,
    pub recently_played_limit: u32,
    pub timeout_ms: u64,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base: "https://api.spotify.com/v1".to_string(),
            accounts_base: "https://accounts.spotify.com".to_string(),
            recently_played_limit: 50,
            timeout_ms: 10_000,
        }
    }
}

impl SpotifyConfig {
    pub fn has_client_credentials(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub intervals: ConfigIntervals,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub catalog: MergePolicy,
    #[serde(default)]
    pub subsonic: SubsonicConfig,
    #[serde(default)]
    pub spotify: SpotifyConfig,
}

impl AppConfig {
    pub fn subsonic_poll_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.subsonic_poll_secs.max(1))
    }

    pub fn spotify_poll_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.spotify_poll_secs.max(1))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            log_level: default_log_level(),
            database: DatabaseConfig::default(),
            http: HttpConfig::default(),
            intervals: ConfigIntervals::default(),
            session: SessionConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            ingest: IngestConfig::default(),
            catalog: MergePolicy::default(),
            subsonic: SubsonicConfig::default(),
            spotify: SpotifyConfig::default(),
        }
    }
}
