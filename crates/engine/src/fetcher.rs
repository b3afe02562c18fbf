use listenledger_core::error::Result;
use listenledger_core::{
    AccountStore, EngineError, NewPlay, PlayLedger, RecentPlay, SourceTag, SpotifyLink,
    TrackCatalog, UserId,
};
use listenledger_providers::{ProviderError, RecentlyPlayedSource};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub fetched: usize,
    pub recorded: usize,
    pub refreshed: bool,
}

/// Copies an external account's recently-played history into the ledger.
pub struct RecentlyPlayedFetcher {
    source: Arc<dyn RecentlyPlayedSource>,
    accounts: Arc<dyn AccountStore>,
    catalog: Arc<dyn TrackCatalog>,
    ledger: Arc<dyn PlayLedger>,
    limit: u32,
}

impl RecentlyPlayedFetcher {
    pub fn new(
        source: Arc<dyn RecentlyPlayedSource>,
        accounts: Arc<dyn AccountStore>,
        catalog: Arc<dyn TrackCatalog>,
        ledger: Arc<dyn PlayLedger>,
        limit: u32,
    ) -> Self {
        Self {
            source,
            accounts,
            catalog,
            ledger,
            limit,
        }
    }

    /// On a rejected access token, refreshes once and retries once.
    pub async fn fetch(&self, link: &SpotifyLink) -> Result<FetchSummary> {
        let (plays, refreshed) = match self
            .source
            .recently_played(&link.access_token, self.limit)
            .await
        {
            Ok(plays) => (plays, false),
            Err(ProviderError::Unauthorized) => {
                let access_token = self.refresh(link).await?;
                let plays = self
                    .source
                    .recently_played(&access_token, self.limit)
                    .await?;
                (plays, true)
            }
            Err(err) => return Err(err.into()),
        };

        let recorded = self.record(link.user_id, &plays).await?;
        debug!(
            user_id = link.user_id,
            fetched = plays.len(),
            recorded,
            "recently played synced"
        );
        Ok(FetchSummary {
            fetched: plays.len(),
            recorded,
            refreshed,
        })
    }

    async fn refresh(&self, link: &SpotifyLink) -> Result<String> {
        let Some(refresh_token) = link.refresh_token.as_deref() else {
            return Err(EngineError::UpstreamUnavailable(
                "access token rejected and no refresh token stored".to_string(),
            ));
        };

        info!(user_id = link.user_id, "access token expired, refreshing");
        let grant = self.source.refresh_token(refresh_token).await?;
        self.accounts
            .store_spotify_tokens(
                link.user_id,
                &grant.access_token,
                grant.refresh_token.as_deref(),
            )
            .await?;
        Ok(grant.access_token)
    }

    /// Oldest first so row ids follow play order.
    async fn record(&self, user_id: UserId, plays: &[RecentPlay]) -> Result<usize> {
        let mut recorded = 0;
        for play in plays.iter().rev() {
            let track_id = self.catalog.upsert(&play.track).await?;
            let outcome = self
                .ledger
                .record_play(&NewPlay {
                    user_id,
                    track_id,
                    played_at: play.played_at,
                    source: SourceTag::Spotify,
                    listened_duration_ms: 0,
                })
                .await?;
            if outcome.is_new() {
                recorded += 1;
            }
        }
        Ok(recorded)
    }
}
