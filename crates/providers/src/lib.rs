use async_trait::async_trait;
use listenledger_core::{EngineError, NowPlayingEntry, RecentPlay, SubsonicTarget};
use std::time::Duration;
use thiserror::Error;

pub mod spotify;
pub mod subsonic;

pub use spotify::SpotifyClient;
pub use subsonic::SubsonicClient;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Timeout, connection failure or a 5xx status.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The credential was refused with a 401.
    #[error("unauthorized")]
    Unauthorized,

    /// A well-formed failure response from the remote protocol.
    #[error("rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

/// Every provider failure is recoverable on a later tick. A 401 from a remote
/// collaborator is not the caller's authentication failure.
impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        EngineError::UpstreamUnavailable(err.to_string())
    }
}

/// Maps a non-success status to an error, 5xx being transient.
pub(crate) fn status_error(status: reqwest::StatusCode, body: String) -> ProviderError {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        ProviderError::Unauthorized
    } else if status.is_server_error() {
        ProviderError::Unavailable(format!("HTTP {status}"))
    } else {
        ProviderError::Rejected {
            code: i64::from(status.as_u16()),
            message: body,
        }
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(5)))
        .user_agent(concat!("listenledger/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::Unavailable(e.to_string()))
}

/// What a streaming server reports for one user at one instant.
#[derive(Debug, Clone)]
pub struct ProviderSnapshot {
    pub provider_name: &'static str,
    pub entry: Option<NowPlayingEntry>,
}

impl ProviderSnapshot {
    pub fn stopped(provider_name: &'static str) -> Self {
        Self {
            provider_name,
            entry: None,
        }
    }

    pub fn playing(provider_name: &'static str, entry: NowPlayingEntry) -> Self {
        Self {
            provider_name,
            entry: Some(entry),
        }
    }
}

/// A fresh credential from the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Only present when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
}

#[async_trait]
pub trait NowPlayingSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn now_playing(&self, target: &SubsonicTarget) -> Result<ProviderSnapshot>;
}

#[async_trait]
pub trait RecentlyPlayedSource: Send + Sync {
    fn name(&self) -> &'static str;
    /// Newest first, as the provider returns them.
    async fn recently_played(&self, access_token: &str, limit: u32) -> Result<Vec<RecentPlay>>;
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant>;
}
