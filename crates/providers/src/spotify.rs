//! Spotify Web API: recently-played history and refresh-token grant.

use crate::{http_client, status_error, ProviderError, RecentlyPlayedSource, Result, TokenGrant};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listenledger_core::config::SpotifyConfig;
use listenledger_core::extract::leading_year;
use listenledger_core::{RecentPlay, TrackFields};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

pub struct SpotifyClient {
    http: Client,
    api_base: String,
    accounts_base: String,
    client_id: String,
    client_secret: String,
}

impl SpotifyClient {
    pub fn new(config: &SpotifyConfig) -> Result<Self> {
        Ok(Self {
            http: http_client(Duration::from_millis(config.timeout_ms))?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            accounts_base: config.accounts_base.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayedPage {
    /// Decoded one by one so a single bad item does not sink the page.
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct PlayHistoryItem {
    track: Value,
    played_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    /// Null for local files.
    id: Option<String>,
    name: String,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
    #[serde(default)]
    album: Option<SpotifyAlbum>,
    #[serde(default)]
    duration_ms: Option<i64>,
    #[serde(default)]
    track_number: Option<i32>,
    #[serde(default)]
    disc_number: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyAlbum {
    name: String,
    #[serde(default)]
    images: Vec<SpotifyImage>,
    #[serde(default)]
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn to_recent_play(item: Value) -> Result<Option<RecentPlay>> {
    let item: PlayHistoryItem =
        serde_json::from_value(item).map_err(|e| ProviderError::Malformed(e.to_string()))?;
    let track: SpotifyTrack = serde_json::from_value(item.track.clone())
        .map_err(|e| ProviderError::Malformed(e.to_string()))?;
    let Some(id) = track.id else {
        return Ok(None);
    };

    let artist = track
        .artists
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut fields = TrackFields::new(format!("spotify:track:{id}"), track.name, artist);
    fields.duration_ms = track.duration_ms;
    fields.track_number = track.track_number;
    fields.disc_number = track.disc_number;
    if let Some(album) = track.album {
        fields.image_url = album.images.into_iter().next().map(|i| i.url);
        fields.year = album.release_date.as_deref().and_then(leading_year);
        fields.album = Some(album.name);
    }
    fields.raw_data = Some(item.track.to_string());

    Ok(Some(RecentPlay {
        track: fields,
        played_at: item.played_at,
    }))
}

#[async_trait]
impl RecentlyPlayedSource for SpotifyClient {
    fn name(&self) -> &'static str {
        "spotify"
    }

    async fn recently_played(&self, access_token: &str, limit: u32) -> Result<Vec<RecentPlay>> {
        let url = format!("{}/me/player/recently-played", self.api_base);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("limit", limit)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let page: RecentlyPlayedPage = response.json().await?;
        let mut plays = Vec::with_capacity(page.items.len());
        for item in page.items {
            match to_recent_play(item) {
                Ok(Some(play)) => plays.push(play),
                Ok(None) => debug!("skipping recently-played item without track id"),
                Err(err) => warn!(error = %err, "skipping malformed recently-played item"),
            }
        }
        Ok(plays)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant> {
        let url = format!("{}/api/token", self.accounts_base);
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self.http.post(&url).form(&form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let token: TokenResponse = response.json().await?;
        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
        })
    }
}
