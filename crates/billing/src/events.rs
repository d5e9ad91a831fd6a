//! Subscription event log
//!
//! Append-only audit trail of lifecycle transitions. Events answer "why is
//! this tenant on this plan?" questions and feed operator tooling; they are
//! immutable once written. A failed write is logged and swallowed so an
//! audit hiccup never aborts the transition it describes.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of subscription lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionEventType {
    PlanUpgraded,
    PlanDowngraded,
    SeatsChanged,
    PaymentSucceeded,
    PaymentFailed,
    Cancelled,
    Reactivated,
    TrialExpired,
    FlaggedForDowngrade,
}

impl std::fmt::Display for SubscriptionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionEventType::PlanUpgraded => "plan_upgraded",
            SubscriptionEventType::PlanDowngraded => "plan_downgraded",
            SubscriptionEventType::SeatsChanged => "seats_changed",
            SubscriptionEventType::PaymentSucceeded => "payment_succeeded",
            SubscriptionEventType::PaymentFailed => "payment_failed",
            SubscriptionEventType::Cancelled => "cancelled",
            SubscriptionEventType::Reactivated => "reactivated",
            SubscriptionEventType::TrialExpired => "trial_expired",
            SubscriptionEventType::FlaggedForDowngrade => "flagged_for_downgrade",
        };
        write!(f, "{}", s)
    }
}

/// Stored audit row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionEventRecord {
    pub id: Uuid,
    pub org_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub event_type: String,
    pub data: serde_json::Value,
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct SubscriptionEventLog {
    pool: PgPool,
}

impl SubscriptionEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an event. Best-effort by design: callers treat failures as
    /// warnings, the state transition itself has already committed.
    pub async fn log(
        &self,
        org_id: Uuid,
        subscription_id: Option<Uuid>,
        event_type: SubscriptionEventType,
        data: serde_json::Value,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO subscription_events (org_id, subscription_id, event_type, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(org_id)
        .bind(subscription_id)
        .bind(event_type.to_string())
        .bind(&data)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                org_id = %org_id,
                event_type = %event_type,
                error = %e,
                "Failed to log subscription event"
            );
        }
    }

    /// Recent events for a tenant, newest first.
    pub async fn recent_for_org(
        &self,
        org_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionEventRecord>> {
        let records = sqlx::query_as(
            r#"
            SELECT id, org_id, subscription_id, event_type, data, created_at
            FROM subscription_events
            WHERE org_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_render_snake_case() {
        assert_eq!(SubscriptionEventType::PlanUpgraded.to_string(), "plan_upgraded");
        assert_eq!(
            SubscriptionEventType::PlanDowngraded.to_string(),
            "plan_downgraded"
        );
        assert_eq!(SubscriptionEventType::SeatsChanged.to_string(), "seats_changed");
        assert_eq!(
            SubscriptionEventType::FlaggedForDowngrade.to_string(),
            "flagged_for_downgrade"
        );
    }
}
