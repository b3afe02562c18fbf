//! Push ingestion of ListenBrainz-style submissions.

use crate::tracker::PollSessionTracker;
use chrono::{DateTime, Utc};
use listenledger_core::error::Result;
use listenledger_core::extract::{
    derived_vendor_id, extract_additional_info, positive_int, timestamp_from_epoch,
};
use listenledger_core::listen::{ListenEvent, ListenSubmission, ListenType, Scrobble};
use listenledger_core::{
    AccountStore, EngineError, FieldIssue, NewPlay, PlayLedger, SourceTag, TrackCatalog,
    TrackFields, TrackId, User, UserId,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct BoardEntry {
    track: TrackFields,
    submitted_at: DateTime<Utc>,
}

/// Latest "playing now" submission per user, forgotten after a TTL.
#[derive(Debug)]
pub struct NowPlayingBoard {
    ttl: chrono::Duration,
    entries: RwLock<HashMap<UserId, BoardEntry>>,
}

impl NowPlayingBoard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::milliseconds(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, user_id: UserId, track: TrackFields, at: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            user_id,
            BoardEntry {
                track,
                submitted_at: at,
            },
        );
    }

    /// The user's entry, or `None` once it is older than the TTL.
    pub fn get(&self, user_id: UserId, now: DateTime<Utc>) -> Option<(TrackFields, DateTime<Utc>)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&user_id)
            .filter(|e| now - e.submitted_at <= self.ttl)
            .map(|e| (e.track.clone(), e.submitted_at))
    }

    /// Drops expired entries.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| now - e.submitted_at <= self.ttl);
        before - entries.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NowPlayingView {
    /// Catalog id when the track has been seen before.
    pub track_id: Option<TrackId>,
    #[serde(flatten)]
    pub track: TrackFields,
    /// `listenbrainz` for a pushed entry, `subsonic` for an open poll session.
    pub source: SourceTag,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScrobbleReceipt {
    pub track_id: TrackId,
    /// False when the same play was already in the ledger.
    pub recorded: bool,
}

pub struct PushIngestor {
    accounts: Arc<dyn AccountStore>,
    catalog: Arc<dyn TrackCatalog>,
    ledger: Arc<dyn PlayLedger>,
    board: NowPlayingBoard,
    polled: Option<Arc<PollSessionTracker>>,
}

impl PushIngestor {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        catalog: Arc<dyn TrackCatalog>,
        ledger: Arc<dyn PlayLedger>,
        now_playing_ttl: Duration,
    ) -> Self {
        Self {
            accounts,
            catalog,
            ledger,
            board: NowPlayingBoard::new(now_playing_ttl),
            polled: None,
        }
    }

    /// Lets [`Self::now_playing`] fall back to open poll sessions.
    pub fn with_poll_sessions(mut self, tracker: Arc<PollSessionTracker>) -> Self {
        self.polled = Some(tracker);
        self
    }

    pub fn board(&self) -> &NowPlayingBoard {
        &self.board
    }

    /// Resolves a listen token. Blank and unknown tokens fail identically.
    pub async fn authenticate(&self, token: &str) -> Result<User> {
        let token = token.trim();
        if token.is_empty() {
            return Err(EngineError::Unauthenticated);
        }
        self.accounts
            .user_by_listen_token(token)
            .await?
            .ok_or(EngineError::Unauthenticated)
    }

    pub async fn submit(&self, token: &str, submission: &ListenSubmission) -> Result<usize> {
        self.submit_at(token, submission, Utc::now()).await
    }

    /// Returns how many events produced a new ledger row.
    pub async fn submit_at(
        &self,
        token: &str,
        submission: &ListenSubmission,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let user = self.authenticate(token).await?;
        self.submit_for(&user, submission, now).await
    }

    /// Same as [`Self::submit_at`] for an already-authenticated user.
    pub async fn submit_for(
        &self,
        user: &User,
        submission: &ListenSubmission,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let events = match submission.listen_type {
            ListenType::PlayingNow => &submission.payload[..submission.payload.len().min(1)],
            ListenType::Single | ListenType::Import => &submission.payload[..],
        };
        let listens = normalize_all(events, now)?;

        if submission.listen_type == ListenType::PlayingNow {
            if let Some((track, _)) = listens.into_iter().next() {
                debug!(user_id = user.id, vendor_id = %track.vendor_id, "now playing updated");
                self.board.set(user.id, track, now);
            }
            return Ok(0);
        }

        let mut accepted = 0;
        for (track, played_at) in &listens {
            let track_id = self.catalog.upsert(track).await?;
            let outcome = self
                .ledger
                .record_play(&NewPlay {
                    user_id: user.id,
                    track_id,
                    played_at: *played_at,
                    source: SourceTag::ListenBrainz,
                    listened_duration_ms: track.duration_ms.unwrap_or(0),
                })
                .await?;
            if outcome.is_new() {
                accepted += 1;
            } else {
                debug!(user_id = user.id, play_id = outcome.play_id(), "listen already recorded");
            }
        }

        info!(
            user_id = user.id,
            listen_type = ?submission.listen_type,
            submitted = listens.len(),
            accepted,
            "listens ingested"
        );
        Ok(accepted)
    }

    /// The user's current "playing now" entry, completed from the catalog.
    /// Without a pushed entry, the most recently updated poll session is used.
    pub async fn now_playing(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<NowPlayingView>> {
        let Some((mut track, submitted_at)) = self.board.get(user_id, now) else {
            return self.polled_now_playing(user_id).await;
        };

        let known = match self.catalog.get_track_by_vendor_id(&track.vendor_id).await? {
            Some(stored) => Some(stored),
            None => {
                self.catalog
                    .find_by_artist_title(&track.artist, &track.title)
                    .await?
            }
        };
        let track_id = known.map(|stored| {
            fill_missing(&mut track, &stored.fields);
            stored.id
        });

        Ok(Some(NowPlayingView {
            track_id,
            track,
            source: SourceTag::ListenBrainz,
            updated_at: submitted_at,
        }))
    }

    async fn polled_now_playing(&self, user_id: UserId) -> Result<Option<NowPlayingView>> {
        let Some(tracker) = &self.polled else {
            return Ok(None);
        };
        let Some(session) = tracker.sessions().latest_for_user(user_id).await else {
            return Ok(None);
        };
        let Some(stored) = self.catalog.get_track_by_vendor_id(&session.vendor_id).await? else {
            return Ok(None);
        };
        Ok(Some(NowPlayingView {
            track_id: Some(stored.id),
            track: stored.fields,
            source: SourceTag::Subsonic,
            updated_at: session.last_update,
        }))
    }

    /// Records one generic scrobble under a `custom:` vendor id.
    pub async fn scrobble_for(&self, user: &User, scrobble: &Scrobble) -> Result<ScrobbleReceipt> {
        let mut issues = Vec::new();
        if scrobble.artist().is_none() {
            issues.push(FieldIssue::missing("artist"));
        }
        if scrobble.track().is_none() {
            issues.push(FieldIssue::missing("track"));
        }
        let played_at = match scrobble.timestamp {
            None => {
                issues.push(FieldIssue::missing("timestamp"));
                None
            }
            Some(raw) => {
                let at = timestamp_from_epoch(raw);
                if at.is_none() {
                    issues.push(FieldIssue {
                        field: "timestamp".to_string(),
                        message: "not a valid unix timestamp".to_string(),
                    });
                }
                at
            }
        };
        let (Some(artist), Some(title), Some(played_at)) =
            (scrobble.artist(), scrobble.track(), played_at)
        else {
            return Err(EngineError::Validation(issues));
        };

        let mut track = TrackFields::new(derived_vendor_id("custom", artist, title), title, artist);
        track.album = scrobble.album().map(str::to_string);
        track.duration_ms = scrobble
            .duration
            .as_ref()
            .and_then(positive_int)
            .and_then(|secs| secs.checked_mul(1_000));

        let track_id = self.catalog.upsert(&track).await?;
        let outcome = self
            .ledger
            .record_play(&NewPlay {
                user_id: user.id,
                track_id,
                played_at,
                source: SourceTag::Scrobble,
                listened_duration_ms: track.duration_ms.unwrap_or(0),
            })
            .await?;
        debug!(user_id = user.id, track_id, recorded = outcome.is_new(), "scrobble ingested");
        Ok(ScrobbleReceipt {
            track_id,
            recorded: outcome.is_new(),
        })
    }
}

fn fill_missing(track: &mut TrackFields, known: &TrackFields) {
    fn fill<T: Clone>(slot: &mut Option<T>, known: &Option<T>) {
        if slot.is_none() {
            slot.clone_from(known);
        }
    }
    fill(&mut track.album, &known.album);
    fill(&mut track.duration_ms, &known.duration_ms);
    fill(&mut track.image_url, &known.image_url);
    fill(&mut track.year, &known.year);
    fill(&mut track.genre, &known.genre);
    fill(&mut track.track_number, &known.track_number);
    fill(&mut track.disc_number, &known.disc_number);
}

/// Validates every event, then maps each to catalog fields and a play time.
/// All offending fields are reported together.
fn normalize_all(
    events: &[ListenEvent],
    now: DateTime<Utc>,
) -> Result<Vec<(TrackFields, DateTime<Utc>)>> {
    let mut issues = Vec::new();
    let mut listens = Vec::with_capacity(events.len());

    for (i, event) in events.iter().enumerate() {
        let meta = &event.track_metadata;
        let artist = meta.artist();
        let title = meta.track();
        if artist.is_none() {
            issues.push(FieldIssue::missing(format!("payload[{i}].track_metadata.artist_name")));
        }
        if title.is_none() {
            issues.push(FieldIssue::missing(format!("payload[{i}].track_metadata.track_name")));
        }
        let played_at = match event.listened_at {
            Some(raw) => match timestamp_from_epoch(raw) {
                Some(at) => Some(at),
                None => {
                    issues.push(FieldIssue {
                        field: format!("payload[{i}].listened_at"),
                        message: "not a valid unix timestamp".to_string(),
                    });
                    None
                }
            },
            None => Some(now),
        };

        if let (Some(artist), Some(title), Some(played_at)) = (artist, title, played_at) {
            listens.push((to_track_fields(event, artist, title), played_at));
        }
    }

    if issues.is_empty() {
        Ok(listens)
    } else {
        Err(EngineError::Validation(issues))
    }
}

fn to_track_fields(event: &ListenEvent, artist: &str, title: &str) -> TrackFields {
    let meta = &event.track_metadata;
    let extracted = meta
        .additional_info
        .as_ref()
        .map(extract_additional_info)
        .unwrap_or_default();

    let vendor_id = match meta.recording_mbid() {
        Some(mbid) => format!("musicbrainz:recording:{mbid}"),
        None => derived_vendor_id(SourceTag::ListenBrainz.as_str(), artist, title),
    };

    let mut fields = TrackFields::new(vendor_id, title, artist);
    fields.album = meta.release().map(str::to_string);
    fields.duration_ms = meta
        .duration_ms
        .as_ref()
        .and_then(positive_int)
        .or(extracted.duration_ms);
    fields.year = extracted.year;
    fields.genre = extracted.genre;
    fields.track_number = extracted.track_number;
    fields.disc_number = extracted.disc_number;
    fields.raw_data = serde_json::to_string(event).ok();
    fields
}
