//! Per-(user, server) listening sessions.
//!
//! [`decide`] is the whole state machine and is pure: it takes the current
//! session (if any), one classified poll result and the poll time, and says
//! what should happen. [`crate::PollSessionTracker`] carries the decision out
//! against storage.

use chrono::{DateTime, Utc};
use listenledger_core::{
    AppConfig, NowPlayingEntry, PlayId, ServerId, SessionConfig, SubsonicTarget, UserId,
};
use listenledger_providers::{ProviderError, ProviderSnapshot};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub type SessionKey = (UserId, ServerId);

pub fn session_key(target: &SubsonicTarget) -> SessionKey {
    (target.user_id, target.server_id)
}

/// An open play accumulating into an already-persisted ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub vendor_id: String,
    pub play_id: PlayId,
    pub last_update: DateTime<Utc>,
    pub track_duration_ms: Option<i64>,
    /// Consecutive failed polls since the last successful one.
    pub failures: u32,
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Upper bound of a single accumulation step.
    pub cap: Duration,
    pub stale_grace_minutes: u32,
    /// Consecutive failures after which the source counts as unreachable.
    pub max_failures: u32,
}

impl SessionPolicy {
    pub fn new(poll_interval: Duration, cfg: &SessionConfig) -> Self {
        Self {
            cap: poll_interval.mul_f64(cfg.cap_multiplier.max(0.0)),
            stale_grace_minutes: cfg.stale_grace_minutes,
            max_failures: cfg.max_consecutive_failures.max(1),
        }
    }

    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.subsonic_poll_interval(), &cfg.session)
    }

    fn cap_ms(&self) -> i64 {
        i64::try_from(self.cap.as_millis()).unwrap_or(i64::MAX)
    }
}

/// One poll result, classified.
#[derive(Debug, Clone)]
pub enum Observation {
    Playing(NowPlayingEntry),
    Nothing,
    /// An entry is reported but its elapsed counter is past the track's end.
    Stale,
    Unreachable(String),
}

impl Observation {
    pub fn classify(
        result: Result<ProviderSnapshot, ProviderError>,
        policy: &SessionPolicy,
    ) -> Self {
        match result {
            Ok(snapshot) => match snapshot.entry {
                Some(entry) if is_stale(&entry, policy.stale_grace_minutes) => Observation::Stale,
                Some(entry) => Observation::Playing(entry),
                None => Observation::Nothing,
            },
            Err(err) => Observation::Unreachable(err.to_string()),
        }
    }
}

/// True when `minutes_ago` exceeds the track length plus `grace_minutes`.
/// An unknown duration counts as zero.
pub fn is_stale(entry: &NowPlayingEntry, grace_minutes: u32) -> bool {
    let duration_minutes = entry.track.duration_ms.unwrap_or(0).max(0) as f64 / 60_000.0;
    f64::from(entry.minutes_ago) > duration_minutes + f64::from(grace_minutes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Idle and nothing to track.
    Stay,
    /// Start a new session, discarding any current one.
    Open,
    /// Same track still playing.
    Continue { delta_ms: i64 },
    Discard,
    /// Transient failure: keep the session, do not accumulate.
    Hold { failures: u32 },
}

pub fn decide(
    current: Option<&Session>,
    observation: &Observation,
    now: DateTime<Utc>,
    policy: &SessionPolicy,
) -> Decision {
    match (current, observation) {
        (None, Observation::Playing(_)) => Decision::Open,
        (None, _) => Decision::Stay,
        (Some(session), Observation::Playing(entry)) => {
            if entry.track.vendor_id == session.vendor_id {
                let elapsed = (now - session.last_update).num_milliseconds();
                Decision::Continue {
                    delta_ms: elapsed.clamp(0, policy.cap_ms()),
                }
            } else {
                Decision::Open
            }
        }
        (Some(_), Observation::Nothing | Observation::Stale) => Decision::Discard,
        (Some(session), Observation::Unreachable(_)) => {
            let failures = session.failures + 1;
            if failures >= policy.max_failures {
                Decision::Discard
            } else {
                Decision::Hold { failures }
            }
        }
    }
}

pub type SessionSlot = Arc<tokio::sync::Mutex<Option<Session>>>;

/// Session state keyed by (user, server), one async lock per key.
///
/// The outer mutex only guards slot lookup and is never held across an
/// await; a slow poll of one target never blocks another.
#[derive(Debug, Default)]
pub struct SessionMap {
    slots: Mutex<HashMap<SessionKey, SessionSlot>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, key: SessionKey) -> SessionSlot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key).or_default().clone()
    }

    /// Drops slots whose key is not in `live`, returning how many went.
    pub fn retain(&self, live: &HashSet<SessionKey>) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|key, _| live.contains(key));
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current session for `key`, waiting for any in-flight poll of it.
    pub async fn get(&self, key: SessionKey) -> Option<Session> {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.get(&key).cloned()
        }?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// The user's open session with the latest update, across all servers.
    pub async fn latest_for_user(&self, user_id: UserId) -> Option<Session> {
        let slots: Vec<SessionSlot> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .iter()
                .filter(|((owner, _), _)| *owner == user_id)
                .map(|(_, slot)| slot.clone())
                .collect()
        };
        let mut latest: Option<Session> = None;
        for slot in slots {
            let Some(session) = slot.lock().await.clone() else {
                continue;
            };
            if latest
                .as_ref()
                .map_or(true, |l| session.last_update > l.last_update)
            {
                latest = Some(session);
            }
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use listenledger_core::TrackFields;

    fn policy() -> SessionPolicy {
        SessionPolicy::new(Duration::from_secs(10), &SessionConfig::default())
    }

    fn entry(vendor_id: &str, duration_ms: Option<i64>, minutes_ago: u32) -> NowPlayingEntry {
        let mut track = TrackFields::new(vendor_id, "Title", "Artist");
        track.duration_ms = duration_ms;
        NowPlayingEntry {
            track,
            minutes_ago,
            player_name: None,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn session(vendor_id: &str, last_update: DateTime<Utc>) -> Session {
        Session {
            vendor_id: vendor_id.to_string(),
            play_id: 1,
            last_update,
            track_duration_ms: Some(200_000),
            failures: 0,
        }
    }

    #[test]
    fn cap_is_multiple_of_interval() {
        assert_eq!(policy().cap, Duration::from_secs(25));
    }

    #[test]
    fn stale_when_minutes_ago_past_duration_plus_grace() {
        assert!(is_stale(&entry("v", Some(180_000), 10), 5));
        assert!(!is_stale(&entry("v", Some(180_000), 8), 5));
        assert!(!is_stale(&entry("v", Some(180_000), 0), 5));
        assert!(is_stale(&entry("v", None, 6), 5));
    }

    #[test]
    fn idle_opens_on_playing_only() {
        let p = policy();
        let playing = Observation::Playing(entry("v1", Some(200_000), 0));
        assert_eq!(decide(None, &playing, at(0), &p), Decision::Open);
        assert_eq!(decide(None, &Observation::Nothing, at(0), &p), Decision::Stay);
        assert_eq!(decide(None, &Observation::Stale, at(0), &p), Decision::Stay);
        assert_eq!(
            decide(None, &Observation::Unreachable("timeout".into()), at(0), &p),
            Decision::Stay
        );
    }

    #[test]
    fn same_track_accumulates_capped_delta() {
        let p = policy();
        let current = session("v1", at(0));
        let playing = Observation::Playing(entry("v1", Some(200_000), 0));

        assert_eq!(
            decide(Some(&current), &playing, at(10), &p),
            Decision::Continue { delta_ms: 10_000 }
        );
        assert_eq!(
            decide(Some(&current), &playing, at(30), &p),
            Decision::Continue { delta_ms: 25_000 }
        );
        assert_eq!(
            decide(Some(&current), &playing, at(-5), &p),
            Decision::Continue { delta_ms: 0 }
        );
    }

    #[test]
    fn different_track_reopens() {
        let current = session("v1", at(0));
        let playing = Observation::Playing(entry("v2", Some(200_000), 0));
        assert_eq!(decide(Some(&current), &playing, at(10), &policy()), Decision::Open);
    }

    #[test]
    fn nothing_or_stale_discards() {
        let current = session("v1", at(0));
        let p = policy();
        assert_eq!(
            decide(Some(&current), &Observation::Nothing, at(10), &p),
            Decision::Discard
        );
        assert_eq!(
            decide(Some(&current), &Observation::Stale, at(10), &p),
            Decision::Discard
        );
    }

    #[test]
    fn failures_hold_until_threshold() {
        let p = policy();
        let mut current = session("v1", at(0));
        let down = Observation::Unreachable("timeout".into());

        assert_eq!(
            decide(Some(&current), &down, at(10), &p),
            Decision::Hold { failures: 1 }
        );
        current.failures = 1;
        assert_eq!(
            decide(Some(&current), &down, at(20), &p),
            Decision::Hold { failures: 2 }
        );
        current.failures = 2;
        assert_eq!(decide(Some(&current), &down, at(30), &p), Decision::Discard);
    }

    #[test]
    fn classify_marks_stale_entries() {
        let p = policy();
        let stale = ProviderSnapshot::playing("subsonic", entry("v1", Some(180_000), 10));
        assert!(matches!(
            Observation::classify(Ok(stale), &p),
            Observation::Stale
        ));
        assert!(matches!(
            Observation::classify(Ok(ProviderSnapshot::stopped("subsonic")), &p),
            Observation::Nothing
        ));
        assert!(matches!(
            Observation::classify(Err(ProviderError::Unavailable("timeout".into())), &p),
            Observation::Unreachable(_)
        ));
    }

    #[tokio::test]
    async fn map_prunes_dead_keys() {
        let map = SessionMap::new();
        *map.slot((1, 1)).lock().await = Some(session("v1", at(0)));
        map.slot((1, 2));
        map.slot((2, 3));

        let live: HashSet<_> = [(1, 1)].into_iter().collect();
        assert_eq!(map.retain(&live), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get((1, 1)).await.unwrap().vendor_id, "v1");
        assert!(map.get((2, 3)).await.is_none());
    }

    #[tokio::test]
    async fn latest_session_per_user_spans_servers() {
        let map = SessionMap::new();
        *map.slot((1, 1)).lock().await = Some(session("older", at(0)));
        *map.slot((1, 2)).lock().await = Some(session("newer", at(30)));
        *map.slot((2, 3)).lock().await = Some(session("bob", at(60)));
        map.slot((1, 4));

        assert_eq!(map.latest_for_user(1).await.unwrap().vendor_id, "newer");
        assert_eq!(map.latest_for_user(2).await.unwrap().vendor_id, "bob");
        assert!(map.latest_for_user(3).await.is_none());
    }
}
