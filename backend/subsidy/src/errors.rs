//! Application-wide error types.

use std::fmt;

use thiserror::Error;

use crate::models::MilestoneStatus;

/// Why a disbursement was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisbursementRejection {
    /// The milestone was absent or not `VERIFIED` when the call started.
    NotVerified,
    /// Another disbursement committed first; this attempt was rolled back.
    ConcurrentPaymentLost,
}

impl fmt::Display for DisbursementRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotVerified => f.write_str("milestone is not awaiting payment"),
            Self::ConcurrentPaymentLost => f.write_str("another disbursement won the race"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SubsidyError {
    #[error("Not found or forbidden: {0}")]
    NotFoundOrForbidden(String),

    #[error("Invalid transition: milestone {milestone_id} is not {expected}")]
    InvalidTransition {
        milestone_id: String,
        expected: MilestoneStatus,
    },

    #[error("Milestone {milestone_id} already paid or not verified: {reason}")]
    AlreadyPaidOrNotVerified {
        milestone_id: String,
        reason: DisbursementRejection,
    },

    #[error("Invalid production volume: {0}")]
    InvalidVolume(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Payload too large: {0}")]
    TooLarge(String),

    // Storage messages stay out of `Display`; the source is kept for logs.
    #[error("Persistence failure")]
    Persistence(#[from] sqlx::Error),

    #[error("File storage failure")]
    Io(#[from] std::io::Error),

    #[error("Migration failure")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SubsidyError {
    /// True for failures of the storage layer rather than of a caller's request.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_)
                | Self::Io(_)
                | Self::Migrate(_)
                | Self::Corrupt(_)
                | Self::Config(_)
        )
    }
}

/// True when `err` is a unique-constraint violation reported by the database.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub type Result<T> = std::result::Result<T, SubsidyError>;
