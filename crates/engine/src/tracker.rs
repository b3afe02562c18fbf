use crate::session::{
    decide, session_key, Decision, Observation, Session, SessionKey, SessionMap, SessionPolicy,
};
use chrono::{DateTime, Utc};
use listenledger_core::error::Result;
use listenledger_core::{NewPlay, PlayId, PlayLedger, SourceTag, SubsonicTarget, TrackCatalog};
use listenledger_providers::NowPlayingSource;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

pub type SessionClaim = OwnedMutexGuard<Option<Session>>;

/// What one poll did to its (user, server) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A previous poll of the same target is still running.
    Busy,
    Idle,
    Opened { play_id: PlayId },
    Accumulated { play_id: PlayId, delta_ms: i64 },
    Discarded,
    Held { failures: u32 },
}

/// Turns repeated "now playing" snapshots into one ledger row per
/// continuous play.
pub struct PollSessionTracker {
    source: Arc<dyn NowPlayingSource>,
    catalog: Arc<dyn TrackCatalog>,
    ledger: Arc<dyn PlayLedger>,
    sessions: SessionMap,
    policy: SessionPolicy,
}

impl PollSessionTracker {
    pub fn new(
        source: Arc<dyn NowPlayingSource>,
        catalog: Arc<dyn TrackCatalog>,
        ledger: Arc<dyn PlayLedger>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            source,
            catalog,
            ledger,
            sessions: SessionMap::new(),
            policy,
        }
    }

    pub fn sessions(&self) -> &SessionMap {
        &self.sessions
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Exclusive hold on `target`'s session, or `None` while a poll of it
    /// is in flight.
    pub fn try_claim(&self, target: &SubsonicTarget) -> Option<SessionClaim> {
        self.sessions.slot(session_key(target)).try_lock_owned().ok()
    }

    /// Polls `target` using a claim taken earlier with [`Self::try_claim`].
    pub async fn poll_claimed(
        &self,
        mut claim: SessionClaim,
        target: &SubsonicTarget,
    ) -> Result<PollOutcome> {
        let result = self.source.now_playing(target).await;
        let observation = Observation::classify(result, &self.policy);
        self.apply(&mut claim, target, observation, Utc::now()).await
    }

    /// Polls `target` unless a poll of it is already in flight.
    pub async fn try_poll(&self, target: &SubsonicTarget) -> Result<PollOutcome> {
        match self.try_claim(target) {
            Some(claim) => self.poll_claimed(claim, target).await,
            None => {
                debug!(
                    user_id = target.user_id,
                    server_id = target.server_id,
                    "previous poll still in flight, skipping"
                );
                Ok(PollOutcome::Busy)
            }
        }
    }

    /// Polls `target`, waiting for any in-flight poll of it to finish first.
    pub async fn poll(&self, target: &SubsonicTarget) -> Result<PollOutcome> {
        let slot = self.sessions.slot(session_key(target));
        let mut guard = slot.lock().await;
        let result = self.source.now_playing(target).await;
        let observation = Observation::classify(result, &self.policy);
        self.apply(&mut guard, target, observation, Utc::now()).await
    }

    /// Feeds an already-classified observation taken at `now`.
    pub async fn observe(
        &self,
        target: &SubsonicTarget,
        observation: Observation,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome> {
        let slot = self.sessions.slot(session_key(target));
        let mut guard = slot.lock().await;
        self.apply(&mut guard, target, observation, now).await
    }

    pub fn prune(&self, live: &HashSet<SessionKey>) -> usize {
        self.sessions.retain(live)
    }

    async fn apply(
        &self,
        slot: &mut Option<Session>,
        target: &SubsonicTarget,
        observation: Observation,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome> {
        let decision = decide(slot.as_ref(), &observation, now, &self.policy);
        let (user_id, server_id) = session_key(target);

        match (decision, observation) {
            (Decision::Stay, Observation::Unreachable(reason)) => {
                warn!(user_id, server_id, error = %reason, "now playing poll failed");
                Ok(PollOutcome::Idle)
            }
            (Decision::Stay, _) => Ok(PollOutcome::Idle),
            (Decision::Hold { failures }, observation) => {
                if let Observation::Unreachable(reason) = observation {
                    warn!(user_id, server_id, failures, error = %reason, "now playing poll failed, holding session");
                }
                if let Some(session) = slot.as_mut() {
                    session.failures = failures;
                }
                Ok(PollOutcome::Held { failures })
            }
            (Decision::Discard, observation) => {
                if let Observation::Unreachable(reason) = &observation {
                    warn!(user_id, server_id, error = %reason, "source unreachable, closing session");
                }
                if let Some(closed) = slot.take() {
                    debug!(user_id, server_id, play_id = closed.play_id, vendor_id = %closed.vendor_id, "session closed");
                }
                Ok(PollOutcome::Discarded)
            }
            (Decision::Continue { delta_ms }, _) => {
                let Some(session) = slot.as_mut() else {
                    return Ok(PollOutcome::Idle);
                };
                if delta_ms > 0 {
                    self.ledger.add_listened(session.play_id, delta_ms).await?;
                }
                session.last_update = now;
                session.failures = 0;
                debug!(user_id, server_id, play_id = session.play_id, delta_ms, "session accumulated");
                Ok(PollOutcome::Accumulated {
                    play_id: session.play_id,
                    delta_ms,
                })
            }
            (Decision::Open, Observation::Playing(entry)) => {
                // The previous row is already durable; nothing to finalize.
                *slot = None;

                let track_id = self.catalog.upsert(&entry.track).await?;
                let outcome = self
                    .ledger
                    .record_play(&NewPlay {
                        user_id,
                        track_id,
                        played_at: now,
                        source: SourceTag::Subsonic,
                        listened_duration_ms: 0,
                    })
                    .await?;
                let play_id = outcome.play_id();

                debug!(
                    user_id,
                    server_id,
                    play_id,
                    vendor_id = %entry.track.vendor_id,
                    player = entry.player_name.as_deref().unwrap_or("-"),
                    "session opened"
                );
                *slot = Some(Session {
                    vendor_id: entry.track.vendor_id,
                    play_id,
                    last_update: now,
                    track_duration_ms: entry.track.duration_ms,
                    failures: 0,
                });
                Ok(PollOutcome::Opened { play_id })
            }
            (Decision::Open, _) => Ok(PollOutcome::Idle),
        }
    }
}
