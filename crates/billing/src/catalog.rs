//! Plan, region, and coupon catalog
//!
//! Catalog rows feed the pricing calculator. Plan base prices are
//! monthly-equivalent rates per billing cycle: the yearly and three-year
//! bases are independent catalog values, not a derivation of the monthly
//! price. Changing a catalog row never reprices an existing subscription;
//! subscriptions carry their own price snapshot.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};

/// Billing cycle for a platform subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
    #[serde(rename = "3_year")]
    ThreeYear,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
            BillingCycle::ThreeYear => "3_year",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            "3_year" => Ok(BillingCycle::ThreeYear),
            other => Err(BillingError::UnknownBillingCycle(other.to_string())),
        }
    }

    /// Number of calendar months one billing period covers.
    pub fn months(&self) -> i32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
            BillingCycle::ThreeYear => 36,
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Catalog entry for a subscription plan.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionPlan {
    pub slug: String,
    pub name: String,
    pub base_price_monthly: f64,
    pub base_price_yearly: f64,
    pub base_price_three_year: f64,
    pub max_users: i32,
    pub max_clients: i32,
    pub max_storage_gb: i32,
    pub is_active: bool,
}

impl SubscriptionPlan {
    /// The cycle-specific monthly-equivalent base price. Longer cycles carry
    /// their own discounted catalog rate; there is no further multiplicative
    /// cycle discount downstream.
    pub fn base_price_for_cycle(&self, cycle: BillingCycle) -> f64 {
        match cycle {
            BillingCycle::Monthly => self.base_price_monthly,
            BillingCycle::Yearly => self.base_price_yearly,
            BillingCycle::ThreeYear => self.base_price_three_year,
        }
    }
}

/// Purchasing-power-parity pricing region, relative to the USD baseline.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PricingRegion {
    pub code: String,
    pub currency: String,
    /// PPP factor. A missing multiplier means baseline pricing (1.0).
    pub price_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponKind {
    Percent,
    Fixed,
}

impl CouponKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "percent" => Some(CouponKind::Percent),
            "fixed" => Some(CouponKind::Fixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Coupon {
    pub code: String,
    pub kind: CouponKind,
    pub value: f64,
    pub min_purchase: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
struct CouponRow {
    code: String,
    kind: String,
    value: f64,
    min_purchase: Option<f64>,
}

/// Read-only access to the pricing catalog.
#[derive(Clone)]
pub struct CatalogStore {
    pool: PgPool,
}

impl CatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_plan(&self, slug: &str) -> BillingResult<SubscriptionPlan> {
        let plan: Option<SubscriptionPlan> = sqlx::query_as(
            r#"
            SELECT slug, name, base_price_monthly, base_price_yearly,
                   base_price_three_year, max_users, max_clients,
                   max_storage_gb, is_active
            FROM subscription_plans
            WHERE slug = $1 AND is_active
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::UnknownPlan(slug.to_string()))
    }

    pub async fn get_region(&self, code: &str) -> BillingResult<Option<PricingRegion>> {
        let region: Option<PricingRegion> = sqlx::query_as(
            "SELECT code, currency, price_multiplier FROM pricing_regions WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(region)
    }

    /// Look up an active coupon. Unknown or inactive codes resolve to `None`;
    /// pricing treats that the same as no coupon at all.
    pub async fn get_coupon(&self, code: &str) -> BillingResult<Option<Coupon>> {
        let row: Option<CouponRow> = sqlx::query_as(
            "SELECT code, kind, value, min_purchase FROM coupons WHERE code = $1 AND is_active",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            let kind = CouponKind::parse(&r.kind)?;
            Some(Coupon {
                code: r.code,
                kind,
                value: r.value,
                min_purchase: r.min_purchase,
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_cycle_round_trips() {
        for cycle in [
            BillingCycle::Monthly,
            BillingCycle::Yearly,
            BillingCycle::ThreeYear,
        ] {
            assert_eq!(BillingCycle::parse(cycle.as_str()).unwrap(), cycle);
        }
        assert!(BillingCycle::parse("weekly").is_err());
    }

    #[test]
    fn yearly_base_is_independent_of_monthly() {
        let plan = SubscriptionPlan {
            slug: "growth".into(),
            name: "Growth".into(),
            base_price_monthly: 23.0,
            base_price_yearly: 19.0,
            base_price_three_year: 16.0,
            max_users: 25,
            max_clients: 500,
            max_storage_gb: 100,
            is_active: true,
        };
        assert_eq!(plan.base_price_for_cycle(BillingCycle::Yearly), 19.0);
        assert_ne!(
            plan.base_price_for_cycle(BillingCycle::Yearly),
            plan.base_price_monthly / 12.0
        );
    }
}
