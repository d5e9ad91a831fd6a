//! Subscription lifecycle engine
//!
//! Sole mutator of `platform_subscriptions.status`. Consumes normalized
//! gateway events and pricing-calculator output to drive the state machine:
//! `trialing -> active -> {past_due <-> active, cancelled}`, with explicit
//! reactivation out of `cancelled` and a time-based `trialing ->
//! trial_expired` sweep. Webhook-driven transitions are idempotent
//! state-sets, so events for the same subscription may arrive in any order.
//!
//! Plan and seat changes take effect immediately in both directions; the
//! proration delta is computed from daily rates over the remaining days of
//! the current period. `monthly_price` and `mrr` are snapshots — catalog
//! price changes never retroactively alter an existing period.

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{BillingCycle, CatalogStore};
use crate::config::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::{SubscriptionEventLog, SubscriptionEventType};
use crate::pricing::{compute_price, normalize_seat_count, prorate, Proration};

/// Consecutive failed payments after which a tenant is flagged for forced
/// downgrade. The flag is consumed by an external billing-ops notifier; the
/// engine itself never sends notifications.
pub const MAX_FAILED_PAYMENTS: i32 = 3;

pub const STATUS_TRIALING: &str = "trialing";
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_PAST_DUE: &str = "past_due";
pub const STATUS_CANCELLED: &str = "cancelled";
pub const STATUS_TRIAL_EXPIRED: &str = "trial_expired";

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, org_id, plan_slug, billing_cycle, seat_count, status,
    monthly_price, mrr, region_code, current_period_start,
    current_period_end, trial_ends_at, failed_payment_count,
    downgrade_flagged_at, created_at, updated_at
"#;

/// A tenant's platform subscription.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlatformSubscription {
    pub id: Uuid,
    pub org_id: Uuid,
    pub plan_slug: String,
    pub billing_cycle: String,
    pub seat_count: i32,
    pub status: String,
    pub monthly_price: f64,
    pub mrr: f64,
    pub region_code: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub failed_payment_count: i32,
    pub downgrade_flagged_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Outcome of a plan switch.
#[derive(Debug, Clone, Serialize)]
pub struct PlanChange {
    pub from_plan: String,
    pub to_plan: String,
    pub from_cycle: String,
    pub to_cycle: String,
    pub new_monthly_price: f64,
    pub new_mrr: f64,
    pub proration: Proration,
    /// `plan_upgraded` or `plan_downgraded`, decided by relative MRR.
    pub event_type: String,
}

/// Outcome of a seat count change.
#[derive(Debug, Clone, Serialize)]
pub struct SeatChange {
    pub old_seat_count: i32,
    pub new_seat_count: i32,
    pub new_mrr: f64,
    pub proration: Proration,
}

pub struct SubscriptionService {
    pool: PgPool,
    catalog: CatalogStore,
    events: SubscriptionEventLog,
    clock: Arc<dyn Clock>,
}

impl SubscriptionService {
    pub fn new(
        pool: PgPool,
        catalog: CatalogStore,
        events: SubscriptionEventLog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            catalog,
            events,
            clock,
        }
    }

    /// Start a trial subscription for a tenant that has none yet. The price
    /// snapshot is taken now and stays fixed for the life of the period.
    pub async fn start_trial(
        &self,
        org_id: Uuid,
        plan_slug: &str,
        cycle: BillingCycle,
        requested_seats: f64,
        region_code: Option<&str>,
        trial_days: i64,
    ) -> BillingResult<PlatformSubscription> {
        let seats = normalize_seat_count(requested_seats)?;
        let plan = self.catalog.get_plan(plan_slug).await?;
        let region = match region_code {
            Some(code) => self.catalog.get_region(code).await?,
            None => None,
        };

        let base = plan.base_price_for_cycle(cycle);
        let monthly_price = compute_price(base, region.as_ref(), 1, cycle, None)?;
        let mrr = compute_price(base, region.as_ref(), seats, cycle, None)?;

        let now = self.clock.now();
        let trial_ends_at = now + time::Duration::days(trial_days.max(0));

        let sub: Option<PlatformSubscription> = sqlx::query_as(&format!(
            r#"
            INSERT INTO platform_subscriptions
                (org_id, plan_slug, billing_cycle, seat_count, status,
                 monthly_price, mrr, region_code, trial_ends_at)
            VALUES ($1, $2, $3, $4, 'trialing', $5, $6, $7, $8)
            ON CONFLICT (org_id) DO NOTHING
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(org_id)
        .bind(plan_slug)
        .bind(cycle.as_str())
        .bind(seats as i32)
        .bind(monthly_price)
        .bind(mrr)
        .bind(region_code)
        .bind(trial_ends_at)
        .fetch_optional(&self.pool)
        .await?;

        let sub = sub.ok_or_else(|| {
            BillingError::InvalidTransition("organization already has a subscription".to_string())
        })?;

        tracing::info!(
            org_id = %org_id,
            plan = %plan_slug,
            cycle = %cycle,
            seats = seats,
            mrr = mrr,
            "Trial subscription started"
        );

        Ok(sub)
    }

    pub async fn get_for_org(&self, org_id: Uuid) -> BillingResult<PlatformSubscription> {
        let sub: Option<PlatformSubscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM platform_subscriptions WHERE org_id = $1"
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or(BillingError::SubscriptionNotFound)
    }

    /// Tenant-scoped read by subscription id. Another tenant's id behaves
    /// exactly like a nonexistent one.
    pub async fn get_scoped(
        &self,
        org_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<PlatformSubscription> {
        let sub: Option<PlatformSubscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM platform_subscriptions \
             WHERE id = $1 AND org_id = $2"
        ))
        .bind(subscription_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or(BillingError::SubscriptionNotFound)
    }

    /// Switch plan and/or billing cycle, effective immediately in both
    /// directions. Switching to the identical plan+cycle is rejected.
    pub async fn switch_plan(
        &self,
        org_id: Uuid,
        new_plan_slug: &str,
        new_cycle: BillingCycle,
    ) -> BillingResult<PlanChange> {
        let sub = self.get_for_org(org_id).await?;

        if sub.plan_slug == new_plan_slug && sub.billing_cycle == new_cycle.as_str() {
            return Err(BillingError::InvalidTransition(format!(
                "already on plan {} with {} billing",
                new_plan_slug, new_cycle
            )));
        }

        let plan = self.catalog.get_plan(new_plan_slug).await?;
        let region = match &sub.region_code {
            Some(code) => self.catalog.get_region(code).await?,
            None => None,
        };

        let seat_count = u32::try_from(sub.seat_count.max(1)).unwrap_or(1);
        let base = plan.base_price_for_cycle(new_cycle);
        let new_monthly_price = compute_price(base, region.as_ref(), 1, new_cycle, None)?;
        let new_mrr = compute_price(base, region.as_ref(), seat_count, new_cycle, None)?;

        let now = self.clock.now();
        let proration = match (sub.current_period_start, sub.current_period_end) {
            (Some(start), Some(end)) => prorate(sub.mrr, new_mrr, start, end, now),
            _ => Proration::zero(),
        };

        let event_type = if new_mrr >= sub.mrr {
            SubscriptionEventType::PlanUpgraded
        } else {
            SubscriptionEventType::PlanDowngraded
        };

        sqlx::query(
            r#"
            UPDATE platform_subscriptions
            SET plan_slug = $2, billing_cycle = $3,
                monthly_price = $4, mrr = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .bind(new_plan_slug)
        .bind(new_cycle.as_str())
        .bind(new_monthly_price)
        .bind(new_mrr)
        .execute(&self.pool)
        .await?;

        self.events
            .log(
                org_id,
                Some(sub.id),
                event_type,
                serde_json::json!({
                    "from_plan": sub.plan_slug,
                    "to_plan": new_plan_slug,
                    "from_cycle": sub.billing_cycle,
                    "to_cycle": new_cycle.as_str(),
                    "old_mrr": sub.mrr,
                    "new_mrr": new_mrr,
                    "proration_delta": proration.delta,
                    "days_remaining": proration.days_remaining,
                }),
            )
            .await;

        tracing::info!(
            org_id = %org_id,
            from_plan = %sub.plan_slug,
            to_plan = %new_plan_slug,
            to_cycle = %new_cycle,
            proration_delta = proration.delta,
            "Plan switched"
        );

        Ok(PlanChange {
            from_plan: sub.plan_slug,
            to_plan: new_plan_slug.to_string(),
            from_cycle: sub.billing_cycle,
            to_cycle: new_cycle.as_str().to_string(),
            new_monthly_price,
            new_mrr,
            proration,
            event_type: event_type.to_string(),
        })
    }

    /// Change the seat count, recomputing MRR and prorating the remainder of
    /// the current period at the new rate.
    pub async fn set_seat_count(&self, org_id: Uuid, requested: f64) -> BillingResult<SeatChange> {
        let seats = normalize_seat_count(requested)?;
        let sub = self.get_for_org(org_id).await?;

        let cycle = BillingCycle::parse(&sub.billing_cycle)?;
        let plan = self.catalog.get_plan(&sub.plan_slug).await?;
        let region = match &sub.region_code {
            Some(code) => self.catalog.get_region(code).await?,
            None => None,
        };

        let base = plan.base_price_for_cycle(cycle);
        let new_mrr = compute_price(base, region.as_ref(), seats, cycle, None)?;

        let now = self.clock.now();
        let proration = match (sub.current_period_start, sub.current_period_end) {
            (Some(start), Some(end)) => prorate(sub.mrr, new_mrr, start, end, now),
            _ => Proration::zero(),
        };

        sqlx::query(
            r#"
            UPDATE platform_subscriptions
            SET seat_count = $2, mrr = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .bind(seats as i32)
        .bind(new_mrr)
        .execute(&self.pool)
        .await?;

        self.events
            .log(
                org_id,
                Some(sub.id),
                SubscriptionEventType::SeatsChanged,
                serde_json::json!({
                    "old_seat_count": sub.seat_count,
                    "new_seat_count": seats,
                    "old_mrr": sub.mrr,
                    "new_mrr": new_mrr,
                    "proration_delta": proration.delta,
                }),
            )
            .await;

        Ok(SeatChange {
            old_seat_count: sub.seat_count,
            new_seat_count: seats as i32,
            new_mrr,
            proration,
        })
    }

    /// Payment success: activate, clear the failure counter, and extend the
    /// period by one billing-cycle unit. Setting the status absolutely makes
    /// replays and out-of-order delivery harmless, and is also how a
    /// `trial_expired` tenant re-enters `active`.
    pub async fn on_payment_succeeded(&self, org_id: Uuid) -> BillingResult<()> {
        let sub = self.get_for_org(org_id).await?;
        let cycle = BillingCycle::parse(&sub.billing_cycle)?;

        let now = self.clock.now();
        let period_start = sub.current_period_end.unwrap_or(now);
        let period_end = advance_by_cycle(period_start, cycle);

        sqlx::query(
            r#"
            UPDATE platform_subscriptions
            SET status = 'active',
                failed_payment_count = 0,
                downgrade_flagged_at = NULL,
                current_period_start = $2,
                current_period_end = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .bind(period_start)
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        self.events
            .log(
                org_id,
                Some(sub.id),
                SubscriptionEventType::PaymentSucceeded,
                serde_json::json!({
                    "previous_status": sub.status,
                    "period_start": period_start.unix_timestamp(),
                    "period_end": period_end.unix_timestamp(),
                }),
            )
            .await;

        tracing::info!(
            org_id = %org_id,
            previous_status = %sub.status,
            "Subscription activated on payment success"
        );

        Ok(())
    }

    /// Payment failure: mark past due and count it. At the cap the tenant is
    /// flagged for forced downgrade; the flag is picked up by billing ops.
    pub async fn on_payment_failed(&self, org_id: Uuid, reason: &str) -> BillingResult<()> {
        let sub = self.get_for_org(org_id).await?;

        let failed_count: (i32,) = sqlx::query_as(
            r#"
            UPDATE platform_subscriptions
            SET status = 'past_due',
                failed_payment_count = failed_payment_count + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING failed_payment_count
            "#,
        )
        .bind(sub.id)
        .fetch_one(&self.pool)
        .await?;

        self.events
            .log(
                org_id,
                Some(sub.id),
                SubscriptionEventType::PaymentFailed,
                serde_json::json!({
                    "reason": reason,
                    "failed_payment_count": failed_count.0,
                }),
            )
            .await;

        if failed_count.0 >= MAX_FAILED_PAYMENTS {
            let flagged = sqlx::query(
                r#"
                UPDATE platform_subscriptions
                SET downgrade_flagged_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND downgrade_flagged_at IS NULL
                "#,
            )
            .bind(sub.id)
            .execute(&self.pool)
            .await?;

            if flagged.rows_affected() > 0 {
                self.events
                    .log(
                        org_id,
                        Some(sub.id),
                        SubscriptionEventType::FlaggedForDowngrade,
                        serde_json::json!({ "failed_payment_count": failed_count.0 }),
                    )
                    .await;

                tracing::warn!(
                    org_id = %org_id,
                    failed_payment_count = failed_count.0,
                    "Subscription flagged for forced downgrade"
                );
            }
        }

        Ok(())
    }

    /// User-initiated cancellation out of `active` or `past_due`.
    pub async fn cancel(&self, org_id: Uuid) -> BillingResult<PlatformSubscription> {
        let updated: Option<PlatformSubscription> = sqlx::query_as(&format!(
            r#"
            UPDATE platform_subscriptions
            SET status = 'cancelled', updated_at = NOW()
            WHERE org_id = $1 AND status IN ('active', 'past_due')
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        let sub = match updated {
            Some(sub) => sub,
            None => {
                let current = self.get_for_org(org_id).await?;
                return Err(BillingError::InvalidTransition(format!(
                    "cannot cancel a {} subscription",
                    current.status
                )));
            }
        };

        self.events
            .log(
                org_id,
                Some(sub.id),
                SubscriptionEventType::Cancelled,
                serde_json::json!({}),
            )
            .await;

        Ok(sub)
    }

    /// Explicit reactivation of a cancelled subscription.
    pub async fn reactivate(&self, org_id: Uuid) -> BillingResult<PlatformSubscription> {
        let updated: Option<PlatformSubscription> = sqlx::query_as(&format!(
            r#"
            UPDATE platform_subscriptions
            SET status = 'active', failed_payment_count = 0, updated_at = NOW()
            WHERE org_id = $1 AND status = 'cancelled'
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        let sub = match updated {
            Some(sub) => sub,
            None => {
                let current = self.get_for_org(org_id).await?;
                return Err(BillingError::InvalidTransition(format!(
                    "cannot reactivate a {} subscription",
                    current.status
                )));
            }
        };

        self.events
            .log(
                org_id,
                Some(sub.id),
                SubscriptionEventType::Reactivated,
                serde_json::json!({}),
            )
            .await;

        Ok(sub)
    }

    /// Time-based sweep: expire trials whose window has passed. Re-entry to
    /// `active` requires a successful payment.
    pub async fn expire_trials(&self) -> BillingResult<u64> {
        let now = self.clock.now();
        let expired: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE platform_subscriptions
            SET status = 'trial_expired', updated_at = NOW()
            WHERE status = 'trialing' AND trial_ends_at IS NOT NULL AND trial_ends_at < $1
            RETURNING id, org_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for (sub_id, org_id) in &expired {
            self.events
                .log(
                    *org_id,
                    Some(*sub_id),
                    SubscriptionEventType::TrialExpired,
                    serde_json::json!({}),
                )
                .await;
        }

        Ok(expired.len() as u64)
    }

    /// Subscriptions flagged for forced downgrade, for the operator queue.
    pub async fn flagged_for_downgrade(&self) -> BillingResult<Vec<PlatformSubscription>> {
        let subs = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM platform_subscriptions \
             WHERE downgrade_flagged_at IS NOT NULL ORDER BY downgrade_flagged_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }
}

/// Advance a timestamp by one billing cycle in calendar months, clamping the
/// day to the target month's length (Jan 31 + 1 month = Feb 28/29).
pub fn advance_by_cycle(ts: OffsetDateTime, cycle: BillingCycle) -> OffsetDateTime {
    add_months(ts, cycle.months())
}

fn add_months(ts: OffsetDateTime, months: i32) -> OffsetDateTime {
    let date = ts.date();
    let zero_based = i32::from(u8::from(date.month())) - 1 + months;
    let year = date.year() + zero_based.div_euclid(12);
    let month = Month::try_from((zero_based.rem_euclid(12) + 1) as u8).unwrap_or(Month::January);
    let day = date.day().min(time::util::days_in_year_month(year, month));
    let new_date = Date::from_calendar_date(year, month, day).unwrap_or(date);
    ts.replace_date(new_date)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    #[test]
    fn monthly_cycle_advances_one_month() {
        // 2026-01-15 00:00:00 UTC
        let start = ts(1_768_435_200);
        assert_eq!(start.date().month(), Month::January);
        let next = advance_by_cycle(start, BillingCycle::Monthly);
        assert_eq!(next.date().month(), Month::February);
        assert_eq!(next.date().day(), start.date().day());
    }

    #[test]
    fn month_end_clamps() {
        // 2026-01-31 00:00:00 UTC
        let jan31 = ts(1_769_817_600);
        assert_eq!(jan31.date().day(), 31);
        let next = add_months(jan31, 1);
        assert_eq!(next.date().month(), Month::February);
        assert_eq!(next.date().day(), 28);
    }

    #[test]
    fn yearly_and_three_year_cycles_advance_whole_years() {
        let start = ts(1_768_435_200);
        let yearly = advance_by_cycle(start, BillingCycle::Yearly);
        assert_eq!(yearly.date().year(), start.date().year() + 1);
        assert_eq!(yearly.date().month(), start.date().month());

        let three = advance_by_cycle(start, BillingCycle::ThreeYear);
        assert_eq!(three.date().year(), start.date().year() + 3);
    }

    #[test]
    fn year_rollover_in_december() {
        // 2025-12-10 00:00:00 UTC
        let dec = ts(1_765_324_800);
        assert_eq!(dec.date().month(), Month::December);
        let next = add_months(dec, 1);
        assert_eq!(next.date().year(), dec.date().year() + 1);
        assert_eq!(next.date().month(), Month::January);
    }
}
