//! Wire types of the ListenBrainz-compatible push submission.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListenType {
    Single,
    PlayingNow,
    Import,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSubmission {
    pub listen_type: ListenType,
    #[serde(default)]
    pub payload: Vec<ListenEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listened_at: Option<i64>,
    #[serde(default)]
    pub track_metadata: TrackMetadata,
}

/// Artist and track name are optional here so that a submission missing them
/// still parses and every offending event can be reported at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    /// Clients send either a number or a numeric string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mbid_mapping: Option<MbidMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MbidMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_mbid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_mbid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artist_mbids: Vec<String>,
}

impl TrackMetadata {
    /// Stable external id, preferring the explicit mapping over `additional_info`.
    pub fn recording_mbid(&self) -> Option<&str> {
        let mapped = self
            .mbid_mapping
            .as_ref()
            .and_then(|m| m.recording_mbid.as_deref());
        let extra = self
            .additional_info
            .as_ref()
            .and_then(|info| info.get("recording_mbid"))
            .and_then(Value::as_str);
        mapped
            .or(extra)
            .map(str::trim)
            .filter(|mbid| !mbid.is_empty())
    }

    pub fn artist(&self) -> Option<&str> {
        non_blank(self.artist_name.as_deref())
    }

    pub fn track(&self) -> Option<&str> {
        non_blank(self.track_name.as_deref())
    }

    pub fn release(&self) -> Option<&str> {
        non_blank(self.release_name.as_deref())
    }
}

/// Body of the generic scrobble endpoint: one finished play, duration in
/// seconds, timestamp in seconds or milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scrobble {
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl Scrobble {
    pub fn artist(&self) -> Option<&str> {
        non_blank(self.artist.as_deref())
    }

    pub fn track(&self) -> Option<&str> {
        non_blank(self.track.as_deref())
    }

    pub fn album(&self) -> Option<&str> {
        non_blank(self.album.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
