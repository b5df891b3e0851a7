//! Database layer: pool setup, migrations and read queries.
//!
//! Mutating workflows live in [`crate::lifecycle`], [`crate::disbursement`]
//! and [`crate::accounts`].

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::models::{
    Milestone, MilestoneRow, Payment, PaymentRow, Project, ProjectRow, Role, MILESTONE_COLUMNS,
    PAYMENT_COLUMNS, PROJECT_COLUMNS,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(
    database_url: &str,
    max_connections: u32,
    busy_timeout: Duration,
) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Make sure the file is created if it doesn't exist yet.
    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Ownership lookups
// ─────────────────────────────────────────────────────────

/// Return the producer that owns `project_id`, or `None` if the project is unknown.
pub async fn find_project_owner<'e, E>(executor: E, project_id: &str) -> Result<Option<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT producer_id FROM projects WHERE id = ?1")
        .bind(project_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|(owner,)| owner))
}

/// True when `producer_id` names an account with the producer role.
pub async fn producer_exists<'e, E>(executor: E, producer_id: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM users WHERE id = ?1 AND role = ?2")
        .bind(producer_id)
        .bind(Role::Producer)
        .fetch_optional(executor)
        .await?;
    Ok(row.is_some())
}

// ─────────────────────────────────────────────────────────
// Project reads
// ─────────────────────────────────────────────────────────

pub async fn get_project(pool: &SqlitePool, project_id: &str) -> Result<Option<Project>> {
    let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1");
    sqlx::query_as::<_, ProjectRow>(&sql)
        .bind(project_id)
        .fetch_optional(pool)
        .await?
        .map(Project::try_from)
        .transpose()
}

/// Fetch every project owned by a producer, oldest first.
pub async fn list_projects_for_producer(
    pool: &SqlitePool,
    producer_id: &str,
) -> Result<Vec<Project>> {
    let sql = format!(
        "SELECT {PROJECT_COLUMNS} FROM projects WHERE producer_id = ?1 ORDER BY created_at ASC, id ASC"
    );
    sqlx::query_as::<_, ProjectRow>(&sql)
        .bind(producer_id)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(Project::try_from)
        .collect()
}

// ─────────────────────────────────────────────────────────
// Milestone reads
// ─────────────────────────────────────────────────────────

pub async fn get_milestone(pool: &SqlitePool, milestone_id: &str) -> Result<Option<Milestone>> {
    let sql = format!("SELECT {MILESTONE_COLUMNS} FROM milestones WHERE id = ?1");
    sqlx::query_as::<_, MilestoneRow>(&sql)
        .bind(milestone_id)
        .fetch_optional(pool)
        .await?
        .map(Milestone::try_from)
        .transpose()
}

/// Fetch all milestones for a given project, oldest first.
pub async fn list_milestones_for_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<Milestone>> {
    let sql = format!(
        "SELECT {MILESTONE_COLUMNS} FROM milestones WHERE project_id = ?1 ORDER BY created_at ASC, id ASC"
    );
    sqlx::query_as::<_, MilestoneRow>(&sql)
        .bind(project_id)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(Milestone::try_from)
        .collect()
}

// ─────────────────────────────────────────────────────────
// Payment reads
// ─────────────────────────────────────────────────────────

/// Fetch every payment recorded against a milestone, failed ones included.
pub async fn get_payments_for_milestone(
    pool: &SqlitePool,
    milestone_id: &str,
) -> Result<Vec<Payment>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM subsidy_payments WHERE milestone_id = ?1 ORDER BY payment_date ASC, id ASC"
    );
    sqlx::query_as::<_, PaymentRow>(&sql)
        .bind(milestone_id)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(Payment::try_from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fresh_db, seed_producer, seed_project};

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = fresh_db().await;
        sqlx::migrate!("./migrations").run(&db.pool).await.unwrap();
    }

    #[tokio::test]
    async fn project_owner_lookup() {
        let db = fresh_db().await;
        let producer = seed_producer(&db.pool, "owner@example.com").await;
        let project = seed_project(&db.pool, &producer).await;

        assert_eq!(
            find_project_owner(&db.pool, &project.id).await.unwrap(),
            Some(producer.clone())
        );
        assert_eq!(find_project_owner(&db.pool, "missing").await.unwrap(), None);
        let owned = list_projects_for_producer(&db.pool, &producer).await.unwrap();
        assert_eq!(owned, vec![project]);
        assert!(producer_exists(&db.pool, &producer).await.unwrap());
        assert!(!producer_exists(&db.pool, "nobody").await.unwrap());
    }

    #[tokio::test]
    async fn reads_of_unknown_ids_are_empty() {
        let db = fresh_db().await;
        assert!(get_project(&db.pool, "nope").await.unwrap().is_none());
        assert!(get_milestone(&db.pool, "nope").await.unwrap().is_none());
        assert!(list_milestones_for_project(&db.pool, "nope")
            .await
            .unwrap()
            .is_empty());
        assert!(get_payments_for_milestone(&db.pool, "nope")
            .await
            .unwrap()
            .is_empty());
    }
}
