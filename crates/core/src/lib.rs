pub mod config;
pub mod error;
pub mod extract;
pub mod listen;
pub mod model;
pub mod traits;

pub use config::{AppConfig, ConfigIntervals, MergePolicy, SessionConfig, TrackColumn};
pub use error::{EngineError, FieldIssue, StoreError};
pub use model::{
    ledger_timestamp, NewPlay, NowPlayingEntry, PlayId, PlayRecord, RecentPlay, RecordOutcome,
    ServerId, SourceTag, SpotifyLink, StoredTrack, SubsonicTarget, TrackFields, TrackId, User,
    UserId,
};
pub use traits::{AccountStore, PlayLedger, StoreResult, TrackCatalog};
