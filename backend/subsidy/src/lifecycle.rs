//! Milestone lifecycle: submission and verification.
//!
//! Every transition is a single conditional statement guarded by the current
//! status, so two callers racing on one milestone can never both succeed.
//! Payment (`VERIFIED -> PAID`) is owned by [`crate::disbursement`].

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;
use crate::errors::{Result, SubsidyError};
use crate::models::{Milestone, MilestoneRow, MilestoneStatus, MILESTONE_COLUMNS};

#[derive(Clone)]
pub struct MilestoneLifecycle {
    pool: SqlitePool,
}

impl MilestoneLifecycle {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a production claim of `volume` kilograms against a project
    /// owned by `requester_id`.
    pub async fn submit(
        &self,
        project_id: &str,
        requester_id: &str,
        volume: Decimal,
    ) -> Result<Milestone> {
        if volume < Decimal::ZERO {
            return Err(SubsidyError::InvalidVolume(format!(
                "{volume} kg is negative"
            )));
        }

        let now = Utc::now();
        let milestone = Milestone {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            target_production: volume,
            verified_production: volume,
            subsidy_amount: None,
            status: MilestoneStatus::PendingVerification,
            verification_timestamp: None,
            payment_timestamp: None,
            created_at: now,
            updated_at: now,
        };

        // Ownership check and insert are one autocommit write, so a busy
        // database is waited out by the busy handler instead of failing fast.
        let inserted = sqlx::query(
            r#"
            INSERT INTO milestones
                (id, project_id, target_production, verified_production, status,
                 created_at, updated_at)
            SELECT ?1, id, ?3, ?4, ?5, ?6, ?7
            FROM projects
            WHERE id = ?2 AND producer_id = ?8
            "#,
        )
        .bind(&milestone.id)
        .bind(&milestone.project_id)
        .bind(milestone.target_production.to_string())
        .bind(milestone.verified_production.to_string())
        .bind(milestone.status)
        .bind(milestone.created_at)
        .bind(milestone.updated_at)
        .bind(requester_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Diagnosis only; the caller sees the same refusal either way.
            match db::find_project_owner(&self.pool, project_id).await {
                Ok(None) => warn!("Milestone submission refused: project {project_id} not found"),
                Ok(Some(_)) => warn!(
                    "Milestone submission refused: project {project_id} not owned by {requester_id}"
                ),
                Err(e) => warn!("Milestone submission refused for project {project_id}: {e}"),
            }
            return Err(SubsidyError::NotFoundOrForbidden(format!(
                "project {project_id}"
            )));
        }

        info!(
            "Milestone {} submitted for project {project_id} ({volume} kg), pending verification",
            milestone.id
        );
        Ok(milestone)
    }

    /// Move a milestone from `PENDING_VERIFICATION` to `VERIFIED`.
    ///
    /// The status check and the write are one statement. An absent milestone
    /// and one in any other state both yield [`SubsidyError::InvalidTransition`]
    /// and leave storage untouched.
    pub async fn verify(&self, milestone_id: &str) -> Result<Milestone> {
        let sql = format!(
            r#"
            UPDATE milestones
            SET    status = ?1, verification_timestamp = ?2, updated_at = ?2
            WHERE  id = ?3 AND status = ?4
            RETURNING {MILESTONE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, MilestoneRow>(&sql)
            .bind(MilestoneStatus::Verified)
            .bind(Utc::now())
            .bind(milestone_id)
            .bind(MilestoneStatus::PendingVerification)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                info!("Milestone {milestone_id} verified");
                Milestone::try_from(row)
            }
            None => {
                warn!("Milestone {milestone_id} not found or not awaiting verification");
                Err(SubsidyError::InvalidTransition {
                    milestone_id: milestone_id.to_string(),
                    expected: MilestoneStatus::PendingVerification,
                })
            }
        }
    }
}
