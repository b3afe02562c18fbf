//! Reconciliation of polled, pushed and fetched listening activity into the
//! play ledger.

mod fetcher;
mod ingest;
mod scheduler;
mod session;
#[cfg(test)]
mod testing;
mod tracker;

pub use fetcher::{FetchSummary, RecentlyPlayedFetcher};
pub use ingest::{NowPlayingBoard, NowPlayingView, PushIngestor, ScrobbleReceipt};
pub use scheduler::{Scheduler, SchedulerTiming, SweepSummary};
pub use session::{
    decide, is_stale, session_key, Decision, Observation, Session, SessionKey, SessionMap,
    SessionPolicy,
};
pub use tracker::{PollOutcome, PollSessionTracker, SessionClaim};
