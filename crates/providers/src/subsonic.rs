//! Subsonic-protocol "now playing" client.
//!
//! Every request carries salted-token auth: `t = md5(password + salt)` with a
//! fresh random salt, so the password never travels in clear.

use crate::{http_client, status_error, NowPlayingSource, ProviderError, ProviderSnapshot, Result};
use async_trait::async_trait;
use listenledger_core::config::SubsonicConfig;
use listenledger_core::{NowPlayingEntry, SubsonicTarget, TrackFields};
use md5::{Digest, Md5};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub struct SubsonicClient {
    http: Client,
    client_name: String,
    api_version: String,
}

impl SubsonicClient {
    pub fn new(config: &SubsonicConfig) -> Result<Self> {
        Ok(Self {
            http: http_client(Duration::from_millis(config.timeout_ms))?,
            client_name: config.client_name.clone(),
            api_version: config.api_version.clone(),
        })
    }

    fn auth_params(&self, username: &str, password: &str) -> Vec<(&'static str, String)> {
        let salt = hex::encode(rand::thread_rng().gen::<[u8; 6]>());
        vec![
            ("u", username.to_string()),
            ("t", salted_token(password, &salt)),
            ("s", salt),
            ("v", self.api_version.clone()),
            ("c", self.client_name.clone()),
            ("f", "json".to_string()),
        ]
    }
}

pub fn salted_token(password: &str, salt: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// `<base>/rest/<method>.view?<params>`, tolerating a trailing slash on `base`.
pub fn endpoint(base_url: &str, method: &str, params: &[(&str, String)]) -> Result<Url> {
    let raw = format!("{}/rest/{method}.view", base_url.trim_end_matches('/'));
    let mut url = Url::parse(&raw)
        .map_err(|e| ProviderError::Rejected {
            code: 0,
            message: format!("invalid server url {base_url}: {e}"),
        })?;
    url.query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "subsonic-response")]
    response: SubsonicResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubsonicResponse {
    status: String,
    #[serde(default)]
    error: Option<SubsonicFault>,
    #[serde(default)]
    now_playing: Option<NowPlayingList>,
}

#[derive(Debug, Deserialize)]
struct SubsonicFault {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct NowPlayingList {
    #[serde(default)]
    entry: Option<OneOrMany>,
}

/// Servers serialize a single-element list as a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Value>),
    One(Value),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<Value> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(v) => vec![v],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NowPlayingItem {
    id: Value,
    title: String,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    album: Option<String>,
    /// Seconds.
    #[serde(default)]
    duration: Option<i64>,
    #[serde(default)]
    cover_art: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    genre: Option<String>,
    #[serde(default, alias = "bitrate")]
    bit_rate: Option<i32>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    suffix: Option<String>,
    #[serde(default)]
    track: Option<i32>,
    #[serde(default)]
    disc_number: Option<i32>,
    #[serde(default)]
    minutes_ago: Option<u32>,
    #[serde(default)]
    player_name: Option<String>,
}

fn native_id(id: &Value) -> Option<String> {
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl SubsonicClient {
    fn to_entry(
        &self,
        target: &SubsonicTarget,
        raw: Value,
        item: NowPlayingItem,
    ) -> Result<NowPlayingEntry> {
        let id = native_id(&item.id)
            .ok_or_else(|| ProviderError::Malformed("now playing entry without id".into()))?;

        let image_url = match item.cover_art.as_deref() {
            Some(cover) => {
                let mut params = vec![("id", cover.to_string())];
                params.extend(self.auth_params(&target.username, &target.password));
                Some(endpoint(&target.base_url, "getCoverArt", &params)?.to_string())
            }
            None => None,
        };

        let track = TrackFields {
            vendor_id: format!("subsonic:track:{id}"),
            title: item.title,
            artist: item.artist.unwrap_or_else(|| "Unknown Artist".to_string()),
            album: item.album,
            duration_ms: item
                .duration
                .filter(|secs| *secs > 0)
                .and_then(|secs| secs.checked_mul(1000)),
            image_url,
            year: item.year,
            genre: item.genre,
            bitrate: item.bit_rate,
            codec: item.content_type.or(item.suffix),
            track_number: item.track,
            disc_number: item.disc_number,
            raw_data: Some(raw.to_string()),
        };

        Ok(NowPlayingEntry {
            track,
            minutes_ago: item.minutes_ago.unwrap_or(0),
            player_name: item.player_name,
        })
    }
}

#[async_trait]
impl NowPlayingSource for SubsonicClient {
    fn name(&self) -> &'static str {
        "subsonic"
    }

    async fn now_playing(&self, target: &SubsonicTarget) -> Result<ProviderSnapshot> {
        let params = self.auth_params(&target.username, &target.password);
        let url = endpoint(&target.base_url, "getNowPlaying", &params)?;

        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let envelope: Envelope = response.json().await?;
        let body = envelope.response;
        if body.status != "ok" {
            let fault = body.error.unwrap_or(SubsonicFault {
                code: 0,
                message: format!("status {}", body.status),
            });
            return Err(ProviderError::Rejected {
                code: fault.code,
                message: fault.message,
            });
        }

        let entries = body
            .now_playing
            .and_then(|list| list.entry)
            .map(OneOrMany::into_vec)
            .unwrap_or_default();

        let mine = entries.into_iter().find(|e| {
            e.get("username").and_then(Value::as_str) == Some(target.username.as_str())
        });

        let Some(raw) = mine else {
            debug!(server_id = target.server_id, "nothing playing for user");
            return Ok(ProviderSnapshot::stopped(self.name()));
        };

        let item: NowPlayingItem = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let entry = self.to_entry(target, raw, item)?;
        Ok(ProviderSnapshot::playing(self.name(), entry))
    }
}
