//! Best-effort metadata extraction from loosely typed client payloads.
//!
//! Every function here is pure and total: unparseable input yields `None`
//! rather than an error, because a listen with partial metadata is still a
//! listen.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Epoch values below this are seconds, anything above is milliseconds.
const SECONDS_CUTOFF: i64 = 10_000_000_000;

const YEAR_KEYS: [&str; 5] = [
    "year",
    "date",
    "release_date",
    "originaldate",
    "original_release_date",
];
const GENRE_KEYS: [&str; 3] = ["genre", "genres", "tags"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedMeta {
    pub duration_ms: Option<i64>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    pub track_number: Option<i32>,
    pub disc_number: Option<i32>,
}

/// `"2020-05-01"` → 2020, `"1999"` → 1999, `"May 2020"` → `None`.
pub fn leading_year(text: &str) -> Option<i32> {
    let text = text.trim();
    let bytes = text.as_bytes();
    if bytes.len() < 4 || !bytes[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    if bytes.get(4).is_some_and(u8::is_ascii_digit) {
        return None;
    }
    text[..4].parse().ok()
}

pub fn year_from_value(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .filter(|y| (1000..=9999).contains(y))
            .map(|y| y as i32),
        Value::String(s) => leading_year(s),
        Value::Array(items) => items.iter().find_map(year_from_value),
        _ => None,
    }
}

/// First non-empty genre: the head of an array, or the whole string.
pub fn first_genre(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim()).filter(|s| !s.is_empty()).map(str::to_string),
        Value::Array(items) => items.iter().find_map(first_genre),
        _ => None,
    }
}

/// A positive integer from a number or a numeric string.
pub fn positive_int(value: &Value) -> Option<i64> {
    let n = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }?;
    (n > 0).then_some(n)
}

/// Track/disc numbers, accepting the `"3/12"` form.
pub fn ordinal(value: &Value) -> Option<i32> {
    match value {
        Value::String(s) => {
            let head = s.split('/').next().unwrap_or_default();
            positive_int(&Value::String(head.to_string())).and_then(|n| i32::try_from(n).ok())
        }
        other => positive_int(other).and_then(|n| i32::try_from(n).ok()),
    }
}

pub fn extract_additional_info(info: &Map<String, Value>) -> ExtractedMeta {
    let duration_ms = info
        .get("duration_ms")
        .and_then(positive_int)
        .or_else(|| {
            info.get("duration")
                .and_then(positive_int)
                .and_then(|secs| secs.checked_mul(1_000))
        });
    let year = YEAR_KEYS
        .iter()
        .filter_map(|k| info.get(*k))
        .find_map(year_from_value);
    let genre = GENRE_KEYS
        .iter()
        .filter_map(|k| info.get(*k))
        .find_map(first_genre);
    let track_number = ["tracknumber", "track_number"]
        .iter()
        .filter_map(|k| info.get(*k))
        .find_map(ordinal);
    let disc_number = ["discnumber", "disc_number"]
        .iter()
        .filter_map(|k| info.get(*k))
        .find_map(ordinal);

    ExtractedMeta {
        duration_ms,
        year,
        genre,
        track_number,
        disc_number,
    }
}

/// Deterministic vendor id for sources without a stable native id.
pub fn derived_vendor_id(source: &str, artist: &str, title: &str) -> String {
    format!("{source}:{artist}:{title}")
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Interprets a client-supplied epoch value that may be seconds or milliseconds.
pub fn timestamp_from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw < SECONDS_CUTOFF {
        Utc.timestamp_opt(raw, 0).single()
    } else {
        Utc.timestamp_millis_opt(raw).single()
    }
}
