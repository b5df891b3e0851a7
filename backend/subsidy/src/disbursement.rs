//! Subsidy disbursement: the atomic `VERIFIED -> PAID` transition.
//!
//! ## Transaction shape
//!
//! ```text
//! BEGIN
//!   1. touch milestone WHERE status = VERIFIED  RETURNING volume   (takes the write lock)
//!   2. amount = volume × rate
//!   3. INSERT payment (COMPLETED)                                   (unique per live milestone)
//!   4. UPDATE milestone -> PAID WHERE status = VERIFIED             (second compare-and-set)
//!   5. projects.total_subsidy_allocated += amount
//! COMMIT  | ROLLBACK on any failure
//! ```
//!
//! Step 1 is the first statement of the transaction and is a write, so SQLite
//! grants the write lock before any value is read. A concurrent call blocks
//! there until this one commits and then finds the milestone `PAID`.
//! Steps 3 and 4 are independent guards: whichever one trips, the whole
//! transaction is rolled back and no payment row survives.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{is_unique_violation, DisbursementRejection, Result, SubsidyError};
use crate::models::{parse_decimal, MilestoneStatus, Payment, PaymentStatus};

/// Decimal places kept on every disbursed amount.
const AMOUNT_SCALE: u32 = 2;

/// Milestone values read under the write lock at the start of a disbursement.
#[derive(Debug, Clone)]
pub(crate) struct LockedClaim {
    pub milestone_id: String,
    pub project_id: String,
    pub verified_production: Decimal,
}

#[derive(Clone)]
pub struct DisbursementEngine {
    pool: SqlitePool,
    rate: Decimal,
}

impl DisbursementEngine {
    /// `rate` is the subsidy paid per verified kilogram.
    pub fn new(pool: SqlitePool, rate: Decimal) -> Self {
        Self { pool, rate }
    }

    pub fn rate(&self) -> Decimal {
        self.rate
    }

    /// Subsidy owed for `volume` kilograms at this engine's rate.
    pub fn subsidy_for(&self, volume: Decimal) -> Result<Decimal> {
        subsidy_amount(volume, self.rate)
    }

    /// Pay the subsidy for a `VERIFIED` milestone exactly once.
    pub async fn disburse(&self, milestone_id: &str) -> Result<Payment> {
        let mut tx = self.pool.begin().await?;
        let outcome = match lock_verified(&mut tx, milestone_id).await {
            Ok(claim) => self.settle(&mut tx, claim).await,
            Err(e) => Err(e),
        };
        finish(tx, outcome).await
    }

    /// Steps 2–5 against a claim taken in the same transaction.
    pub(crate) async fn settle(
        &self,
        conn: &mut SqliteConnection,
        claim: LockedClaim,
    ) -> Result<Payment> {
        let amount = self.subsidy_for(claim.verified_production)?;
        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4().to_string(),
            milestone_id: claim.milestone_id.clone(),
            project_id: claim.project_id.clone(),
            amount,
            status: PaymentStatus::Completed,
            transaction_id: transaction_reference(now),
            payment_date: now,
        };

        insert_payment(conn, &payment).await?;
        mark_paid(conn, &claim.milestone_id, amount, now).await?;
        add_to_project_total(conn, &claim.project_id, amount).await?;
        Ok(payment)
    }
}

/// `volume × rate`, rounded half away from zero to cents.
pub fn subsidy_amount(volume: Decimal, rate: Decimal) -> Result<Decimal> {
    let raw = volume.checked_mul(rate).ok_or_else(|| {
        SubsidyError::InvalidVolume(format!("{volume} kg overflows the subsidy amount"))
    })?;
    let mut amount = raw.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero);
    amount.rescale(AMOUNT_SCALE);
    Ok(amount)
}

/// Commit a successful disbursement, or roll back everything it wrote.
pub(crate) async fn finish(
    tx: Transaction<'_, Sqlite>,
    outcome: Result<Payment>,
) -> Result<Payment> {
    match outcome {
        Ok(payment) => {
            tx.commit().await?;
            info!(
                "Subsidy of {} disbursed for milestone {} ({})",
                payment.amount, payment.milestone_id, payment.transaction_id
            );
            Ok(payment)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!("Disbursement rollback failed: {rollback_err}");
            }
            Err(e)
        }
    }
}

/// Step 1: claim the milestone's write lock if it is `VERIFIED`.
async fn lock_verified(conn: &mut SqliteConnection, milestone_id: &str) -> Result<LockedClaim> {
    let row: Option<(String, String)> = sqlx::query_as(
        r#"
        UPDATE milestones
        SET    updated_at = ?1
        WHERE  id = ?2 AND status = ?3
        RETURNING project_id, verified_production
        "#,
    )
    .bind(Utc::now())
    .bind(milestone_id)
    .bind(MilestoneStatus::Verified)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((project_id, verified_production)) = row else {
        warn!("Milestone {milestone_id} cannot be paid: not found or not VERIFIED");
        return Err(SubsidyError::AlreadyPaidOrNotVerified {
            milestone_id: milestone_id.to_string(),
            reason: DisbursementRejection::NotVerified,
        });
    };

    Ok(LockedClaim {
        milestone_id: milestone_id.to_string(),
        project_id,
        verified_production: parse_decimal("milestones.verified_production", &verified_production)?,
    })
}

/// Step 3.
async fn insert_payment(conn: &mut SqliteConnection, payment: &Payment) -> Result<()> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO subsidy_payments
            (id, milestone_id, project_id, amount, status, transaction_id, payment_date)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&payment.id)
    .bind(&payment.milestone_id)
    .bind(&payment.project_id)
    .bind(payment.amount.to_string())
    .bind(payment.status)
    .bind(&payment.transaction_id)
    .bind(payment.payment_date)
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => {
            warn!(
                "Milestone {} already has a live payment",
                payment.milestone_id
            );
            Err(lost_race(&payment.milestone_id))
        }
        Err(e) => Err(e.into()),
    }
}

/// Step 4: the second compare-and-set on status.
async fn mark_paid(
    conn: &mut SqliteConnection,
    milestone_id: &str,
    amount: Decimal,
    paid_at: DateTime<Utc>,
) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE milestones
        SET    status = ?1, payment_timestamp = ?2, subsidy_amount = ?3, updated_at = ?2
        WHERE  id = ?4 AND status = ?5
        "#,
    )
    .bind(MilestoneStatus::Paid)
    .bind(paid_at)
    .bind(amount.to_string())
    .bind(milestone_id)
    .bind(MilestoneStatus::Verified)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        warn!("Milestone {milestone_id} left VERIFIED before it could be marked PAID");
        return Err(lost_race(milestone_id));
    }
    Ok(())
}

/// Step 5. The write lock from step 1 is still held, so read-modify-write is safe.
async fn add_to_project_total(
    conn: &mut SqliteConnection,
    project_id: &str,
    amount: Decimal,
) -> Result<()> {
    let (current,): (String,) =
        sqlx::query_as("SELECT total_subsidy_allocated FROM projects WHERE id = ?1")
            .bind(project_id)
            .fetch_one(&mut *conn)
            .await?;
    let total = parse_decimal("projects.total_subsidy_allocated", &current)? + amount;

    sqlx::query("UPDATE projects SET total_subsidy_allocated = ?1 WHERE id = ?2")
        .bind(total.to_string())
        .bind(project_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn lost_race(milestone_id: &str) -> SubsidyError {
    SubsidyError::AlreadyPaidOrNotVerified {
        milestone_id: milestone_id.to_string(),
        reason: DisbursementRejection::ConcurrentPaymentLost,
    }
}

/// `TXN-<unix millis>-<12 random hex chars>`; unique per disbursement.
fn transaction_reference(at: DateTime<Utc>) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("TXN-{}-{}", at.timestamp_millis(), &nonce[..12])
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::db;
    use crate::lifecycle::MilestoneLifecycle;
    use crate::models::Milestone;
    use crate::test_support::{fresh_db, seed_producer, seed_project, TestDb};

    fn rate() -> Decimal {
        Decimal::new(25, 1)
    }

    struct Fixture {
        db: TestDb,
        project_id: String,
        producer_id: String,
        lifecycle: MilestoneLifecycle,
        engine: DisbursementEngine,
    }

    async fn fixture() -> Fixture {
        let db = fresh_db().await;
        let producer_id = seed_producer(&db.pool, "producer@example.com").await;
        let project = seed_project(&db.pool, &producer_id).await;
        Fixture {
            lifecycle: MilestoneLifecycle::new(db.pool.clone()),
            engine: DisbursementEngine::new(db.pool.clone(), rate()),
            project_id: project.id,
            producer_id,
            db,
        }
    }

    impl Fixture {
        async fn submit(&self, kg: i64) -> Milestone {
            self.lifecycle
                .submit(&self.project_id, &self.producer_id, Decimal::new(kg, 0))
                .await
                .unwrap()
        }

        async fn verified(&self, kg: i64) -> Milestone {
            let m = self.submit(kg).await;
            self.lifecycle.verify(&m.id).await.unwrap()
        }

        async fn payments(&self, milestone_id: &str) -> Vec<Payment> {
            db::get_payments_for_milestone(&self.db.pool, milestone_id)
                .await
                .unwrap()
        }

        async fn milestone(&self, milestone_id: &str) -> Milestone {
            db::get_milestone(&self.db.pool, milestone_id)
                .await
                .unwrap()
                .unwrap()
        }

        async fn project_total(&self) -> Decimal {
            db::get_project(&self.db.pool, &self.project_id)
                .await
                .unwrap()
                .unwrap()
                .total_subsidy_allocated
        }
    }

    #[test]
    fn amount_for_1000_kg_at_2_5_is_2500() {
        let amount = subsidy_amount(Decimal::new(1000, 0), rate()).unwrap();
        assert_eq!(amount, Decimal::new(250000, 2));
        assert_eq!(amount.to_string(), "2500.00");
    }

    #[test]
    fn amount_rounds_half_away_from_zero_to_cents() {
        // 1.003 kg × 2.5 = 2.5075
        let amount = subsidy_amount(Decimal::from_str("1.003").unwrap(), rate()).unwrap();
        assert_eq!(amount.to_string(), "2.51");
        assert!(matches!(
            subsidy_amount(Decimal::MAX, rate()),
            Err(SubsidyError::InvalidVolume(_))
        ));
    }

    #[test]
    fn transaction_references_are_unique() {
        let now = Utc::now();
        let a = transaction_reference(now);
        let b = transaction_reference(now);
        assert!(a.starts_with("TXN-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn end_to_end_submit_verify_disburse() {
        let f = fixture().await;
        let m = f.submit(500).await;
        f.lifecycle.verify(&m.id).await.unwrap();

        let payment = f.engine.disburse(&m.id).await.unwrap();
        assert_eq!(payment.amount, Decimal::new(500, 0) * rate());
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.project_id, f.project_id);

        let paid = f.milestone(&m.id).await;
        assert_eq!(paid.status, MilestoneStatus::Paid);
        assert_eq!(paid.subsidy_amount, Some(payment.amount));
        let verified_at = paid.verification_timestamp.unwrap();
        let paid_at = paid.payment_timestamp.unwrap();
        assert!(paid_at >= verified_at);

        let payments = f.payments(&m.id).await;
        assert_eq!(payments, vec![payment.clone()]);
        assert_eq!(f.project_total().await, payment.amount);
    }

    #[tokio::test]
    async fn unverified_milestone_is_not_paid() {
        let f = fixture().await;
        let m = f.submit(100).await;

        let err = f.engine.disburse(&m.id).await.unwrap_err();
        assert!(matches!(
            err,
            SubsidyError::AlreadyPaidOrNotVerified {
                reason: DisbursementRejection::NotVerified,
                ..
            }
        ));
        assert!(f.payments(&m.id).await.is_empty());
        assert_eq!(f.milestone(&m.id).await.status, MilestoneStatus::PendingVerification);
        assert_eq!(f.project_total().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn unknown_milestone_is_not_paid() {
        let f = fixture().await;
        assert!(matches!(
            f.engine.disburse("no-such-milestone").await,
            Err(SubsidyError::AlreadyPaidOrNotVerified { .. })
        ));
    }

    #[tokio::test]
    async fn repeated_disbursement_never_pays_twice() {
        let f = fixture().await;
        let m = f.verified(1000).await;

        let first = f.engine.disburse(&m.id).await.unwrap();
        for _ in 0..3 {
            assert!(matches!(
                f.engine.disburse(&m.id).await,
                Err(SubsidyError::AlreadyPaidOrNotVerified { .. })
            ));
        }
        assert!(matches!(
            f.lifecycle.verify(&m.id).await,
            Err(SubsidyError::InvalidTransition { .. })
        ));

        assert_eq!(f.payments(&m.id).await, vec![first]);
        assert_eq!(f.project_total().await, Decimal::new(250000, 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_disbursements_have_one_winner() {
        let f = fixture().await;
        let m = f.verified(1000).await;

        let (a, b) = tokio::join!(
            {
                let engine = f.engine.clone();
                let id = m.id.clone();
                tokio::spawn(async move { engine.disburse(&id).await })
            },
            {
                let engine = f.engine.clone();
                let id = m.id.clone();
                tokio::spawn(async move { engine.disburse(&id).await })
            }
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(SubsidyError::AlreadyPaidOrNotVerified { .. }))));

        let payments = f.payments(&m.id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Completed);
        assert_eq!(f.milestone(&m.id).await.status, MilestoneStatus::Paid);
        assert_eq!(f.project_total().await, Decimal::new(250000, 2));
    }

    #[tokio::test]
    async fn lost_compare_and_set_rolls_back_the_payment() {
        let f = fixture().await;
        // Still PENDING_VERIFICATION: a claim for it is as stale as one read
        // before a competing transaction committed.
        let m = f.submit(40).await;
        let stale = LockedClaim {
            milestone_id: m.id.clone(),
            project_id: f.project_id.clone(),
            verified_production: m.verified_production,
        };

        let mut tx = f.db.pool.begin().await.unwrap();
        let outcome = f.engine.settle(&mut tx, stale).await;

        let (inside,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM subsidy_payments WHERE milestone_id = ?1")
                .bind(&m.id)
                .fetch_one(&mut *tx)
                .await
                .unwrap();
        assert_eq!(inside, 1, "payment insert precedes the failed update");

        let err = finish(tx, outcome).await.unwrap_err();
        assert!(matches!(
            err,
            SubsidyError::AlreadyPaidOrNotVerified {
                reason: DisbursementRejection::ConcurrentPaymentLost,
                ..
            }
        ));
        assert!(f.payments(&m.id).await.is_empty());
        assert_eq!(f.milestone(&m.id).await.status, MilestoneStatus::PendingVerification);
        assert_eq!(f.project_total().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn live_payment_conflict_is_a_lost_race() {
        let f = fixture().await;
        let m = f.verified(10).await;
        sqlx::query(
            r#"
            INSERT INTO subsidy_payments
                (id, milestone_id, project_id, amount, status, transaction_id, payment_date)
            VALUES ('foreign', ?1, ?2, '1.00', 'COMPLETED', 'TXN-foreign', ?3)
            "#,
        )
        .bind(&m.id)
        .bind(&f.project_id)
        .bind(Utc::now())
        .execute(&f.db.pool)
        .await
        .unwrap();

        assert!(matches!(
            f.engine.disburse(&m.id).await,
            Err(SubsidyError::AlreadyPaidOrNotVerified {
                reason: DisbursementRejection::ConcurrentPaymentLost,
                ..
            })
        ));
        assert_eq!(f.payments(&m.id).await.len(), 1);
        assert_eq!(f.milestone(&m.id).await.status, MilestoneStatus::Verified);
    }

    #[tokio::test]
    async fn failed_payment_does_not_block_disbursement() {
        let f = fixture().await;
        let m = f.verified(10).await;
        sqlx::query(
            r#"
            INSERT INTO subsidy_payments
                (id, milestone_id, project_id, amount, status, transaction_id, payment_date)
            VALUES ('failed', ?1, ?2, '25.00', 'FAILED', 'TXN-failed', ?3)
            "#,
        )
        .bind(&m.id)
        .bind(&f.project_id)
        .bind(Utc::now())
        .execute(&f.db.pool)
        .await
        .unwrap();

        let payment = f.engine.disburse(&m.id).await.unwrap();
        assert_eq!(payment.amount.to_string(), "25.00");
        let statuses: Vec<_> = f
            .payments(&m.id)
            .await
            .into_iter()
            .map(|p| p.status)
            .collect();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.contains(&PaymentStatus::Failed));
        assert!(statuses.contains(&PaymentStatus::Completed));
    }

    #[tokio::test]
    async fn project_total_accumulates_across_milestones() {
        let f = fixture().await;
        let a = f.verified(1000).await;
        let b = f.verified(3).await;
        f.engine.disburse(&a.id).await.unwrap();
        f.engine.disburse(&b.id).await.unwrap();

        assert_eq!(f.project_total().await, Decimal::new(250750, 2));
        assert_eq!(f.engine.rate(), rate());
    }
}
