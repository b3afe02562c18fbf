use serde::Serialize;
use thiserror::Error;

/// One offending field of a rejected listen submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    /// Path into the submitted payload, e.g. `payload[2].track_metadata.artist_name`.
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    pub fn missing(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: "required field is missing or empty".to_string(),
        }
    }
}

/// Failure of the system of record, independent of the backing database.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown or malformed credential. Never says which of the two.
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("invalid listen payload: {}", describe(.0))]
    Validation(Vec<FieldIssue>),

    /// Timeout, network failure, 5xx or an undecodable response. Always
    /// recoverable on a later tick.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

fn describe(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| i.field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, EngineError>;
