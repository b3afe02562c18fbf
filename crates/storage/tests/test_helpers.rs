//! Test helpers for storage integration tests.
//!
//! Databases are real SQLite files in a temp dir so migrations, constraints
//! and WAL mode behave as in production.

#![allow(dead_code)]

use listenledger_core::{MergePolicy, TrackFields, UserId};
use listenledger_storage::SqliteLedger;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Test database wrapper that cleans up on drop
pub struct TestDb {
    pub ledger: SqliteLedger,
    _temp_dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        Self::with_policy(&MergePolicy::default()).await
    }

    pub async fn with_policy(policy: &MergePolicy) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_url = format!("sqlite://{}", temp_dir.path().join("test.db").display());

        let ledger = SqliteLedger::open(&db_url, policy)
            .await
            .expect("Failed to open ledger");

        Self {
            ledger,
            _temp_dir: temp_dir,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.ledger.pool()
    }
}

pub async fn create_test_user(pool: &SqlitePool, username: &str) -> UserId {
    listenledger_storage::accounts::create_user(pool, username, &format!("token-{username}"))
        .await
        .expect("Failed to create test user")
        .id
}

pub fn sample_track(vendor_id: &str) -> TrackFields {
    TrackFields::new(vendor_id, "Teardrop", "Massive Attack")
}
