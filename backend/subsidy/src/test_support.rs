//! Fixtures shared by the module tests: a throwaway on-disk database and seeds.

use std::time::Duration;

use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::accounts;
use crate::db;
use crate::models::Project;

pub struct TestDb {
    pub pool: SqlitePool,
    // Keeps the database file alive for the lifetime of the test.
    _dir: TempDir,
}

pub async fn fresh_db() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("subsidy.db");
    let pool = db::init_pool(path.to_str().unwrap(), 5, Duration::from_secs(10))
        .await
        .unwrap();
    TestDb { pool, _dir: dir }
}

/// Register a producer and return its id. The GST number is derived from the email.
pub async fn seed_producer(pool: &SqlitePool, email: &str) -> String {
    let gst_number = format!("GST-{email}");
    accounts::register_producer(pool, "Test Producer", email, &gst_number, "password")
        .await
        .unwrap()
        .id
}

pub async fn seed_project(pool: &SqlitePool, producer_id: &str) -> Project {
    accounts::register_project(pool, "Test Project", producer_id, Decimal::new(100_000, 0))
        .await
        .unwrap()
}
