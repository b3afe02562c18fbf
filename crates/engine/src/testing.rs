//! Fakes shared by the engine's unit tests.

use async_trait::async_trait;
use listenledger_core::{
    MergePolicy, NowPlayingEntry, RecentPlay, SubsonicTarget, TrackFields, UserId,
};
use listenledger_providers::{
    NowPlayingSource, ProviderError, ProviderSnapshot, RecentlyPlayedSource, Result, TokenGrant,
};
use listenledger_storage::{accounts, SqliteLedger};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// In-memory ledger with users 1 (`alice`, token `token-alice`) and
/// 2 (`bob`, token `token-bob`).
pub async fn ledger() -> Arc<SqliteLedger> {
    let store = SqliteLedger::in_memory(&MergePolicy::default())
        .await
        .expect("in-memory ledger");
    for name in ["alice", "bob"] {
        accounts::create_user(store.pool(), name, &format!("token-{name}"))
            .await
            .expect("create user");
    }
    Arc::new(store)
}

pub fn target(user_id: UserId, server_id: i64) -> SubsonicTarget {
    SubsonicTarget {
        user_id,
        server_id,
        name: None,
        base_url: format!("http://server-{server_id}.test"),
        username: format!("user-{user_id}"),
        password: "secret".to_string(),
    }
}

pub fn entry(vendor_id: &str, duration_ms: i64, minutes_ago: u32) -> NowPlayingEntry {
    let mut track = TrackFields::new(vendor_id, format!("Title {vendor_id}"), "Artist");
    track.duration_ms = Some(duration_ms);
    NowPlayingEntry {
        track,
        minutes_ago,
        player_name: Some("test".to_string()),
    }
}

/// Replays queued results in order, then reports nothing playing.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<ProviderSnapshot>>>,
    pub calls: Mutex<Vec<SubsonicTarget>>,
}

impl ScriptedSource {
    pub fn push(&self, result: Result<ProviderSnapshot>) {
        self.script.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl NowPlayingSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn now_playing(&self, target: &SubsonicTarget) -> Result<ProviderSnapshot> {
        self.calls.lock().unwrap().push(target.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ProviderSnapshot::stopped("scripted")))
    }
}

/// Recently-played source that accepts exactly one access token.
pub struct FakeHistory {
    pub valid_token: String,
    pub plays: Vec<RecentPlay>,
    pub grant: Option<TokenGrant>,
    pub refreshes: Mutex<Vec<String>>,
}

impl FakeHistory {
    pub fn new(valid_token: &str, plays: Vec<RecentPlay>) -> Self {
        Self {
            valid_token: valid_token.to_string(),
            plays,
            grant: None,
            refreshes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RecentlyPlayedSource for FakeHistory {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn recently_played(&self, access_token: &str, limit: u32) -> Result<Vec<RecentPlay>> {
        if self.valid_token != access_token {
            return Err(ProviderError::Unauthorized);
        }
        Ok(self.plays.iter().take(limit as usize).cloned().collect())
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.refreshes.lock().unwrap().push(refresh_token.to_string());
        match &self.grant {
            Some(grant) => Ok(grant.clone()),
            None => Err(ProviderError::Rejected {
                code: 400,
                message: "invalid_grant".to_string(),
            }),
        }
    }
}
