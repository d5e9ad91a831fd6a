//! Billing invariants
//!
//! Runnable consistency checks for the billing system, intended to run after
//! mutations or webhook replays and on a schedule from the worker.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::webhooks::MAX_PROCESSING_ATTEMPTS;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Organization(s) affected
    pub org_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - money may be moving incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct RefundBoundRow {
    org_id: Uuid,
    payment_id: Uuid,
    amount_cents: i64,
    refunded_cents: i64,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleDefaultsRow {
    org_id: Uuid,
    currency: String,
    default_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct RetryCapRow {
    id: Uuid,
    org_id: Uuid,
    retry_count: i32,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PeriodOrderRow {
    org_id: Uuid,
    sub_id: Uuid,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckProcessingRow {
    id: Uuid,
    org_id: Uuid,
    created_at: OffsetDateTime,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_refund_bound().await?);
        violations.extend(self.check_single_default_gateway().await?);
        violations.extend(self.check_retry_cap().await?);
        violations.extend(self.check_period_ordering().await?);
        violations.extend(self.check_no_stuck_processing().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: refunded_cents never exceeds amount_cents, and a
    /// nonzero refund implies a refund-bearing status.
    ///
    /// A violation here means the ledger moved more money out than in.
    async fn check_refund_bound(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RefundBoundRow> = sqlx::query_as(
            r#"
            SELECT org_id, id AS payment_id, amount_cents, refunded_cents, status
            FROM payments
            WHERE refunded_cents > amount_cents
               OR (refunded_cents > 0
                   AND status NOT IN ('refunded', 'partially_refunded'))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refund_within_amount".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Payment {} refunded {} of {} cents with status {}",
                    row.payment_id, row.refunded_cents, row.amount_cents, row.status
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "amount_cents": row.amount_cents,
                    "refunded_cents": row.refunded_cents,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: at most one default active gateway config per tenant
    /// per currency. More than one makes gateway selection ambiguous.
    async fn check_single_default_gateway(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleDefaultsRow> = sqlx::query_as(
            r#"
            SELECT org_id, currency, COUNT(*) AS default_count
            FROM payment_gateway_configs
            WHERE is_default AND is_active
            GROUP BY org_id, currency
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_default_gateway".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Organization has {} default gateways for {} (expected 1)",
                    row.default_count, row.currency
                ),
                context: serde_json::json!({
                    "currency": row.currency,
                    "default_count": row.default_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: no webhook event was retried beyond the cap.
    async fn check_retry_cap(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RetryCapRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, retry_count, status
            FROM webhook_events
            WHERE retry_count > $1
            "#,
        )
        .bind(MAX_PROCESSING_ATTEMPTS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "retry_cap_respected".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Webhook event {} has {} retries (cap {})",
                    row.id, row.retry_count, MAX_PROCESSING_ATTEMPTS
                ),
                context: serde_json::json!({
                    "webhook_event_id": row.id,
                    "retry_count": row.retry_count,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: subscription periods are ordered.
    async fn check_period_ordering(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PeriodOrderRow> = sqlx::query_as(
            r#"
            SELECT org_id, id AS sub_id,
                   current_period_start AS period_start,
                   current_period_end AS period_end
            FROM platform_subscriptions
            WHERE current_period_start IS NOT NULL
              AND current_period_end IS NOT NULL
              AND current_period_start >= current_period_end
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "period_ordering".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Subscription {} has period start {} >= end {}",
                    row.sub_id, row.period_start, row.period_end
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: no event sits in `processing` for more than an hour.
    /// The pipeline marks a terminal state before answering, so a stale
    /// `processing` row means a crashed worker or instance.
    async fn check_no_stuck_processing(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckProcessingRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, created_at
            FROM webhook_events
            WHERE status = 'processing'
              AND created_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_processing".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Webhook event {} stuck in processing since {}",
                    row.id, row.created_at
                ),
                context: serde_json::json!({
                    "webhook_event_id": row.id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
