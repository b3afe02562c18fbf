use crate::fetcher::RecentlyPlayedFetcher;
use crate::ingest::PushIngestor;
use crate::session::session_key;
use crate::tracker::{PollOutcome, PollSessionTracker};
use chrono::Utc;
use listenledger_core::config::SubsonicConfig;
use listenledger_core::error::Result;
use listenledger_core::{AccountStore, AppConfig};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub targets: usize,
    /// Still busy from an earlier sweep, or configured as scrobble-only.
    pub skipped: usize,
    pub failed: usize,
    pub pruned: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerTiming {
    pub subsonic_every: Duration,
    pub spotify_every: Duration,
    pub initial_delay: Duration,
}

impl SchedulerTiming {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            subsonic_every: cfg.subsonic_poll_interval(),
            spotify_every: cfg.spotify_poll_interval(),
            initial_delay: Duration::from_secs(cfg.intervals.initial_delay_secs),
        }
    }
}

/// Drives the session tracker and the recently-played fetcher on two
/// independent timers with bounded fan-out.
#[derive(Clone)]
pub struct Scheduler {
    accounts: Arc<dyn AccountStore>,
    tracker: Arc<PollSessionTracker>,
    fetcher: Option<Arc<RecentlyPlayedFetcher>>,
    ingestor: Option<Arc<PushIngestor>>,
    subsonic: SubsonicConfig,
    timing: SchedulerTiming,
    permits: Arc<Semaphore>,
    subsonic_running: Arc<AtomicBool>,
    spotify_running: Arc<AtomicBool>,
}

/// Marks a sweep kind as running until dropped, including on abort.
struct SweepGuard(Arc<AtomicBool>);

impl SweepGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        tracker: Arc<PollSessionTracker>,
        subsonic: SubsonicConfig,
        timing: SchedulerTiming,
        max_in_flight: usize,
    ) -> Self {
        Self {
            accounts,
            tracker,
            fetcher: None,
            ingestor: None,
            subsonic,
            timing,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            subsonic_running: Arc::new(AtomicBool::new(false)),
            spotify_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<RecentlyPlayedFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Lets the scheduler expire stale "playing now" entries.
    pub fn with_ingestor(mut self, ingestor: Arc<PushIngestor>) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    /// One pass over every streaming-server target. Per-target failures are
    /// logged and counted, never returned.
    pub async fn subsonic_sweep(&self) -> Result<SweepSummary> {
        let targets = self.accounts.subsonic_targets().await?;
        let mut summary = SweepSummary::default();
        let mut live = HashSet::new();
        let mut tasks = JoinSet::new();

        for target in targets {
            summary.targets += 1;
            if self.subsonic.is_scrobble_only(&target.base_url) {
                summary.skipped += 1;
                continue;
            }
            live.insert(session_key(&target));

            // Claim before waiting on a permit: a target still being polled
            // is skipped here.
            let Some(claim) = self.tracker.try_claim(&target) else {
                summary.skipped += 1;
                continue;
            };
            let tracker = self.tracker.clone();
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = tracker.poll_claimed(claim, &target).await;
                (target, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(PollOutcome::Busy))) => summary.skipped += 1,
                Ok((_, Ok(_))) => {}
                Ok((target, Err(err))) => {
                    summary.failed += 1;
                    error!(
                        user_id = target.user_id,
                        server_id = target.server_id,
                        error = %err,
                        "failed to record poll result"
                    );
                }
                Err(err) => {
                    summary.failed += 1;
                    error!(error = %err, "poll task aborted");
                }
            }
        }

        summary.pruned = self.tracker.prune(&live);
        if let Some(ingestor) = &self.ingestor {
            ingestor.board().sweep(Utc::now());
        }
        Ok(summary)
    }

    /// One pass over every linked external account.
    pub async fn spotify_sweep(&self) -> Result<SweepSummary> {
        let Some(fetcher) = self.fetcher.clone() else {
            return Ok(SweepSummary::default());
        };
        let links = self.accounts.spotify_links().await?;
        let mut summary = SweepSummary {
            targets: links.len(),
            ..SweepSummary::default()
        };
        let mut tasks = JoinSet::new();

        for link in links {
            let fetcher = fetcher.clone();
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = fetcher.fetch(&link).await;
                (link.user_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((user_id, Ok(fetched))) => {
                    debug!(user_id, recorded = fetched.recorded, "recently played fetched");
                }
                Ok((user_id, Err(err))) => {
                    summary.failed += 1;
                    warn!(user_id, error = %err, "recently played fetch failed");
                }
                Err(err) => {
                    summary.failed += 1;
                    error!(error = %err, "fetch task aborted");
                }
            }
        }
        Ok(summary)
    }

    /// Ticks until `shutdown` flips or its sender goes away. Sweeps run as
    /// their own tasks, at most one of each kind at a time; a tick that finds
    /// its previous sweep still running is skipped. Sweeps still running at
    /// shutdown are aborted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let start = Instant::now() + self.timing.initial_delay;
        let mut subsonic_tick = interval_at(start, self.timing.subsonic_every);
        subsonic_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut spotify_tick = interval_at(start, self.timing.spotify_every);
        spotify_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweeps = JoinSet::new();

        info!(
            subsonic_every = ?self.timing.subsonic_every,
            spotify_every = ?self.timing.spotify_every,
            spotify = self.fetcher.is_some(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = subsonic_tick.tick() => {
                    let Some(guard) = SweepGuard::acquire(&self.subsonic_running) else {
                        debug!("previous subsonic sweep still running, skipping tick");
                        continue;
                    };
                    let this = self.clone();
                    sweeps.spawn(async move {
                        let _guard = guard;
                        match this.subsonic_sweep().await {
                            Ok(summary) => debug!(?summary, "subsonic sweep finished"),
                            Err(err) => error!(error = %err, "subsonic sweep failed"),
                        }
                    });
                }
                _ = spotify_tick.tick(), if self.fetcher.is_some() => {
                    let Some(guard) = SweepGuard::acquire(&self.spotify_running) else {
                        debug!("previous spotify sweep still running, skipping tick");
                        continue;
                    };
                    let this = self.clone();
                    sweeps.spawn(async move {
                        let _guard = guard;
                        match this.spotify_sweep().await {
                            Ok(summary) => debug!(?summary, "spotify sweep finished"),
                            Err(err) => error!(error = %err, "spotify sweep failed"),
                        }
                    });
                }
                Some(joined) = sweeps.join_next(), if !sweeps.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "sweep task aborted");
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        sweeps.shutdown().await;
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::{Scheduler, SchedulerTiming, SweepSummary};
    use crate::fetcher::RecentlyPlayedFetcher;
    use crate::session::SessionPolicy;
    use crate::testing::{entry, ledger, FakeHistory};
    use crate::tracker::PollSessionTracker;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use listenledger_core::config::SubsonicConfig;
    use listenledger_core::{
        AccountStore, PlayLedger, RecentPlay, ServerId, SessionConfig, SubsonicTarget, TrackFields,
    };
    use listenledger_providers::{
        NowPlayingSource, ProviderError, ProviderSnapshot, Result as ProviderResult,
    };
    use listenledger_storage::{accounts, SqliteLedger};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Plays one track per listed server, fails the others in `down`.
    struct ByServer {
        playing: HashSet<ServerId>,
        down: HashSet<ServerId>,
    }

    #[async_trait]
    impl NowPlayingSource for ByServer {
        fn name(&self) -> &'static str {
            "by-server"
        }

        async fn now_playing(&self, target: &SubsonicTarget) -> ProviderResult<ProviderSnapshot> {
            if self.down.contains(&target.server_id) {
                return Err(ProviderError::Unavailable("connection refused".into()));
            }
            if self.playing.contains(&target.server_id) {
                let vendor = format!("subsonic:track:{}", target.server_id);
                return Ok(ProviderSnapshot::playing("by-server", entry(&vendor, 200_000, 0)));
            }
            Ok(ProviderSnapshot::stopped("by-server"))
        }
    }

    /// Takes `delay` per poll and counts every call.
    struct SlowSource {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NowPlayingSource for SlowSource {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn now_playing(&self, _target: &SubsonicTarget) -> ProviderResult<ProviderSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(ProviderSnapshot::stopped("slow"))
        }
    }

    fn timing() -> SchedulerTiming {
        SchedulerTiming {
            subsonic_every: Duration::from_secs(10),
            spotify_every: Duration::from_secs(300),
            initial_delay: Duration::ZERO,
        }
    }

    async fn scheduler(
        store: &Arc<SqliteLedger>,
        source: impl NowPlayingSource + 'static,
        subsonic: SubsonicConfig,
    ) -> (Scheduler, Arc<PollSessionTracker>) {
        let tracker = Arc::new(PollSessionTracker::new(
            Arc::new(source),
            store.clone(),
            store.clone(),
            SessionPolicy::new(Duration::from_secs(10), &SessionConfig::default()),
        ));
        let scheduler = Scheduler::new(store.clone(), tracker.clone(), subsonic, timing(), 4);
        (scheduler, tracker)
    }

    async fn add_server(store: &SqliteLedger, user_id: i64, url: &str) -> ServerId {
        accounts::add_subsonic_server(store.pool(), user_id, None, url, None, "pw")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sweep_isolates_failing_targets() {
        let store = ledger().await;
        let s1 = add_server(&store, 1, "http://one.test").await;
        let s2 = add_server(&store, 1, "http://two.test").await;
        let s3 = add_server(&store, 2, "http://three.test").await;

        let source = ByServer {
            playing: [s1, s3].into_iter().collect(),
            down: [s2].into_iter().collect(),
        };
        let (scheduler, tracker) = scheduler(&store, source, SubsonicConfig::default()).await;

        let summary = scheduler.subsonic_sweep().await.unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                targets: 3,
                skipped: 0,
                failed: 0,
                pruned: 0
            }
        );
        assert!(tracker.sessions().get((1, s1)).await.is_some());
        assert!(tracker.sessions().get((1, s2)).await.is_none());
        assert!(tracker.sessions().get((2, s3)).await.is_some());
        assert_eq!(store.recent_plays(1, 10).await.unwrap().len(), 1);
        assert_eq!(store.recent_plays(2, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scrobble_only_servers_are_never_polled() {
        let store = ledger().await;
        let polled = add_server(&store, 1, "http://home.test").await;
        let scrobble = add_server(&store, 1, "https://music.scrobble-only.test/").await;

        let source = ByServer {
            playing: [polled, scrobble].into_iter().collect(),
            down: HashSet::new(),
        };
        let subsonic = SubsonicConfig {
            scrobble_only_hosts: vec!["scrobble-only.test".to_string()],
            ..SubsonicConfig::default()
        };
        let (scheduler, tracker) = scheduler(&store, source, subsonic).await;

        let summary = scheduler.subsonic_sweep().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(tracker.sessions().get((1, polled)).await.is_some());
        assert!(tracker.sessions().get((1, scrobble)).await.is_none());
    }

    #[tokio::test]
    async fn sweep_prunes_sessions_of_removed_servers() {
        let store = ledger().await;
        let kept = add_server(&store, 1, "http://kept.test").await;
        let removed = add_server(&store, 1, "http://removed.test").await;

        let source = ByServer {
            playing: [kept, removed].into_iter().collect(),
            down: HashSet::new(),
        };
        let (scheduler, tracker) = scheduler(&store, source, SubsonicConfig::default()).await;
        scheduler.subsonic_sweep().await.unwrap();
        assert_eq!(tracker.sessions().len(), 2);

        sqlx::query("DELETE FROM subsonic_servers WHERE id = ?")
            .bind(removed)
            .execute(store.pool())
            .await
            .unwrap();

        let summary = scheduler.subsonic_sweep().await.unwrap();
        assert_eq!(summary.pruned, 1);
        assert_eq!(tracker.sessions().len(), 1);
    }

    #[tokio::test]
    async fn spotify_sweep_fetches_each_linked_user() {
        let store = ledger().await;
        store.store_spotify_tokens(1, "good", None).await.unwrap();
        store.store_spotify_tokens(2, "stale", None).await.unwrap();

        let plays = vec![RecentPlay {
            track: TrackFields::new("spotify:track:1", "Song", "Band"),
            played_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }];
        let fetcher = Arc::new(RecentlyPlayedFetcher::new(
            Arc::new(FakeHistory::new("good", plays)),
            store.clone(),
            store.clone(),
            store.clone(),
            50,
        ));
        let (scheduler, _) = scheduler(
            &store,
            ByServer {
                playing: HashSet::new(),
                down: HashSet::new(),
            },
            SubsonicConfig::default(),
        )
        .await;
        let scheduler = scheduler.with_fetcher(fetcher);

        let summary = scheduler.spotify_sweep().await.unwrap();
        assert_eq!(summary.targets, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(store.recent_plays(1, 10).await.unwrap().len(), 1);
        assert!(store.recent_plays(2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = ledger().await;
        let (scheduler, _) = scheduler(
            &store,
            ByServer {
                playing: HashSet::new(),
                down: HashSet::new(),
            },
            SubsonicConfig::default(),
        )
        .await;

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler stops")
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_skips_targets_still_being_polled() {
        let store = ledger().await;
        let busy = add_server(&store, 1, "http://busy.test").await;
        let free = add_server(&store, 1, "http://free.test").await;

        let source = ByServer {
            playing: [busy, free].into_iter().collect(),
            down: HashSet::new(),
        };
        let (scheduler, tracker) = scheduler(&store, source, SubsonicConfig::default()).await;

        let targets = store.subsonic_targets().await.unwrap();
        let busy_target = targets.iter().find(|t| t.server_id == busy).unwrap();
        let claim = tracker.try_claim(busy_target).unwrap();

        let summary = scheduler.subsonic_sweep().await.unwrap();
        assert_eq!(summary.skipped, 1);
        drop(claim);

        assert!(tracker.sessions().get((1, busy)).await.is_none());
        assert!(tracker.sessions().get((1, free)).await.is_some());
    }

    #[tokio::test]
    async fn slow_polls_do_not_pile_up_or_outlive_shutdown() {
        let store = ledger().await;
        for i in 0..4 {
            add_server(&store, 1, &format!("http://slow-{i}.test")).await;
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let source = SlowSource {
            delay: Duration::from_millis(200),
            calls: calls.clone(),
        };
        let tracker = Arc::new(PollSessionTracker::new(
            Arc::new(source),
            store.clone(),
            store.clone(),
            SessionPolicy::new(Duration::from_millis(50), &SessionConfig::default()),
        ));
        let timing = SchedulerTiming {
            subsonic_every: Duration::from_millis(50),
            ..timing()
        };
        let scheduler = Scheduler::new(
            store.clone(),
            tracker,
            SubsonicConfig::default(),
            timing,
            1,
        );

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler stops")
            .unwrap();

        // One permit and 200ms per poll: roughly five polls fit in a second.
        let at_shutdown = calls.load(Ordering::SeqCst);
        assert!(at_shutdown <= 7, "{at_shutdown} polls in one second");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), at_shutdown);
    }
}
