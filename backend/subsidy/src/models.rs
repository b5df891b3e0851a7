//! Domain records: users, projects, milestones and subsidy payments.
//!
//! Quantities (kilograms) and money are [`Decimal`] in memory and canonical
//! decimal TEXT at rest. Each table has a `*Row` shape that `sqlx` decodes
//! directly and a domain type built from it with `TryFrom`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SubsidyError};

// ─────────────────────────────────────────────────────────
// Status enums
// ─────────────────────────────────────────────────────────

/// Milestone lifecycle. Only ever moves forward:
///
/// ```text
/// PENDING_VERIFICATION --verify--> VERIFIED --disburse--> PAID
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MilestoneStatus {
    PendingVerification,
    Verified,
    Paid,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingVerification => "PENDING_VERIFICATION",
            Self::Verified => "VERIFIED",
            Self::Paid => "PAID",
        }
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    PendingApproval,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Producer,
    Authority,
}

// ─────────────────────────────────────────────────────────
// Decimal helpers
// ─────────────────────────────────────────────────────────

/// Parse a stored decimal column, naming the column on failure.
pub(crate) fn parse_decimal(column: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| SubsidyError::Corrupt(format!("{column} = {raw:?}: {e}")))
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

/// A registered account. Credentials never leave the database layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Company GST registration number; producers always have one.
    pub gst_number: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Stored credential material for a login attempt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct Credentials {
    pub id: String,
    pub password_hash: String,
    pub password_salt: String,
}

// ─────────────────────────────────────────────────────────
// Projects
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub producer_id: String,
    pub estimated_production: Decimal,
    /// Sum of every completed disbursement against this project's milestones.
    pub total_subsidy_allocated: Decimal,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
}

pub(crate) const PROJECT_COLUMNS: &str = "id, name, producer_id, estimated_production, \
     total_subsidy_allocated, status, created_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ProjectRow {
    pub id: String,
    pub name: String,
    pub producer_id: String,
    pub estimated_production: String,
    pub total_subsidy_allocated: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ProjectRow> for Project {
    type Error = SubsidyError;

    fn try_from(row: ProjectRow) -> Result<Self> {
        Ok(Project {
            estimated_production: parse_decimal(
                "projects.estimated_production",
                &row.estimated_production,
            )?,
            total_subsidy_allocated: parse_decimal(
                "projects.total_subsidy_allocated",
                &row.total_subsidy_allocated,
            )?,
            id: row.id,
            name: row.name,
            producer_id: row.producer_id,
            status: row.status,
            created_at: row.created_at,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Milestones
// ─────────────────────────────────────────────────────────

/// A production claim against a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub project_id: String,
    /// Kilograms claimed at submission.
    pub target_production: Decimal,
    /// Kilograms the subsidy is computed from.
    pub verified_production: Decimal,
    /// Set once, by the disbursement that paid this milestone.
    pub subsidy_amount: Option<Decimal>,
    pub status: MilestoneStatus,
    pub verification_timestamp: Option<DateTime<Utc>>,
    pub payment_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const MILESTONE_COLUMNS: &str = "id, project_id, target_production, \
     verified_production, subsidy_amount, status, verification_timestamp, \
     payment_timestamp, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MilestoneRow {
    pub id: String,
    pub project_id: String,
    pub target_production: String,
    pub verified_production: String,
    pub subsidy_amount: Option<String>,
    pub status: MilestoneStatus,
    pub verification_timestamp: Option<DateTime<Utc>>,
    pub payment_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<MilestoneRow> for Milestone {
    type Error = SubsidyError;

    fn try_from(row: MilestoneRow) -> Result<Self> {
        let subsidy_amount = row
            .subsidy_amount
            .as_deref()
            .map(|raw| parse_decimal("milestones.subsidy_amount", raw))
            .transpose()?;
        Ok(Milestone {
            target_production: parse_decimal(
                "milestones.target_production",
                &row.target_production,
            )?,
            verified_production: parse_decimal(
                "milestones.verified_production",
                &row.verified_production,
            )?,
            subsidy_amount,
            id: row.id,
            project_id: row.project_id,
            status: row.status,
            verification_timestamp: row.verification_timestamp,
            payment_timestamp: row.payment_timestamp,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Payments
// ─────────────────────────────────────────────────────────

/// An append-only subsidy payment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub milestone_id: String,
    pub project_id: String,
    pub amount: Decimal,
    pub status: PaymentStatus,
    /// Locally generated reference; no funds move outside this system.
    pub transaction_id: String,
    pub payment_date: DateTime<Utc>,
}

pub(crate) const PAYMENT_COLUMNS: &str =
    "id, milestone_id, project_id, amount, status, transaction_id, payment_date";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PaymentRow {
    pub id: String,
    pub milestone_id: String,
    pub project_id: String,
    pub amount: String,
    pub status: PaymentStatus,
    pub transaction_id: String,
    pub payment_date: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = SubsidyError;

    fn try_from(row: PaymentRow) -> Result<Self> {
        Ok(Payment {
            amount: parse_decimal("subsidy_payments.amount", &row.amount)?,
            id: row.id,
            milestone_id: row.milestone_id,
            project_id: row.project_id,
            status: row.status,
            transaction_id: row.transaction_id,
            payment_date: row.payment_date,
        })
    }
}
