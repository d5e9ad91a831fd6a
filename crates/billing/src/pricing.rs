//! Pricing calculator
//!
//! Pure functions, no I/O. The order of operations is fixed and observable:
//! cycle base price, then the region PPP multiplier, then the seat volume
//! discount on additional seats, then the coupon, and rounding to two
//! decimals happens exactly once at the end. Intermediate values keep full
//! precision; rounding earlier accumulates visible cent drift at large seat
//! counts.

use serde::Serialize;
use time::OffsetDateTime;

use crate::catalog::{BillingCycle, Coupon, CouponKind, PricingRegion};
use crate::error::{BillingError, BillingResult};

/// Round to 2 decimal places. Applied only to final, user-visible amounts.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Volume discount applied to additional seats (seat 1 is always billed at
/// the undiscounted rate). The tier is selected by the total seat count.
pub fn seat_tier_discount(seat_count: u32) -> f64 {
    match seat_count {
        0..=4 => 0.0,
        5..=9 => 0.05,
        10..=24 => 0.07,
        25..=49 => 0.10,
        50..=99 => 0.12,
        _ => 0.15,
    }
}

/// Validate and normalize a requested seat count. Zero and negative counts
/// are invalid; fractional counts round up so a tenant is never under-billed.
pub fn normalize_seat_count(requested: f64) -> BillingResult<u32> {
    if !requested.is_finite() || requested <= 0.0 {
        return Err(BillingError::InvalidSeatCount(requested as i64));
    }
    Ok(requested.ceil() as u32)
}

/// Compute the final monthly price for a subscription.
///
/// `base_price_for_cycle` is the plan's monthly-equivalent rate for the
/// chosen cycle; the cycle discount is already baked into that catalog value,
/// so no further multiplicative step applies here.
pub fn compute_price(
    base_price_for_cycle: f64,
    region: Option<&PricingRegion>,
    seat_count: u32,
    _cycle: BillingCycle,
    coupon: Option<&Coupon>,
) -> BillingResult<f64> {
    if seat_count == 0 {
        return Err(BillingError::InvalidSeatCount(0));
    }

    let multiplier = region.and_then(|r| r.price_multiplier).unwrap_or(1.0);
    let per_seat = base_price_for_cycle * multiplier;

    let additional_seats = (seat_count - 1) as f64;
    let discount = seat_tier_discount(seat_count);
    let mut total = per_seat + additional_seats * per_seat * (1.0 - discount);

    if let Some(coupon) = coupon {
        total = apply_coupon(total, coupon);
    }

    Ok(round2(total))
}

/// Apply a coupon to a running total. A coupon with an unmet
/// minimum-purchase threshold is silently not applied; a discount that would
/// exceed the total floors the result at zero, never negative.
fn apply_coupon(total: f64, coupon: &Coupon) -> f64 {
    if let Some(min) = coupon.min_purchase {
        if total < min {
            return total;
        }
    }
    match coupon.kind {
        CouponKind::Percent => total * (1.0 - coupon.value / 100.0),
        CouponKind::Fixed => (total - coupon.value).max(0.0),
    }
}

/// Proration of a mid-cycle plan or seat change, computed via daily rates
/// over the remaining days of the current period.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Proration {
    /// Credit for the unused remainder of the old rate.
    pub unused_credit: f64,
    /// Charge for the remainder at the new rate.
    pub new_charge: f64,
    /// `new_charge - unused_credit`: positive means charge now, negative
    /// means a credit is issued.
    pub delta: f64,
    pub days_remaining: i64,
}

impl Proration {
    /// No-op proration, used when the subscription has no current period.
    pub fn zero() -> Self {
        Self {
            unused_credit: 0.0,
            new_charge: 0.0,
            delta: 0.0,
            days_remaining: 0,
        }
    }
}

/// Compute the proration delta for switching from `old_monthly` to
/// `new_monthly` part-way through the period `[period_start, period_end]`.
pub fn prorate(
    old_monthly: f64,
    new_monthly: f64,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> Proration {
    let total_days = (period_end - period_start).whole_days();
    if total_days <= 0 {
        return Proration::zero();
    }

    let days_remaining = (period_end - now).whole_days().clamp(0, total_days);
    let old_daily = old_monthly / total_days as f64;
    let new_daily = new_monthly / total_days as f64;

    let unused_credit = old_daily * days_remaining as f64;
    let new_charge = new_daily * days_remaining as f64;

    Proration {
        unused_credit: round2(unused_credit),
        new_charge: round2(new_charge),
        delta: round2(new_charge - unused_credit),
        days_remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(multiplier: Option<f64>) -> PricingRegion {
        PricingRegion {
            code: "IN".into(),
            currency: "INR".into(),
            price_multiplier: multiplier,
        }
    }

    #[test]
    fn ppp_multiplier_applies_to_base() {
        // base $23, India multiplier 0.35 => $8.05
        let price = compute_price(
            23.0,
            Some(&region(Some(0.35))),
            1,
            BillingCycle::Monthly,
            None,
        )
        .unwrap();
        assert_eq!(price, 8.05);
    }

    #[test]
    fn missing_multiplier_defaults_to_baseline() {
        let price =
            compute_price(23.0, Some(&region(None)), 1, BillingCycle::Monthly, None).unwrap();
        assert_eq!(price, 23.0);
    }

    #[test]
    fn seat_volume_discount_applies_to_additional_seats_only() {
        // 25 seats at base $23 lands in the 10% tier:
        // 23 + 24 * 23 * 0.90 = 519.80
        let price = compute_price(23.0, None, 25, BillingCycle::Monthly, None).unwrap();
        assert_eq!(price, 519.80);
    }

    #[test]
    fn small_teams_get_no_seat_discount() {
        // 4 seats: 23 + 3 * 23 = 92, no tier discount
        let price = compute_price(23.0, None, 4, BillingCycle::Monthly, None).unwrap();
        assert_eq!(price, 92.0);
    }

    #[test]
    fn seat_tier_boundaries() {
        assert_eq!(seat_tier_discount(4), 0.0);
        assert_eq!(seat_tier_discount(5), 0.05);
        assert_eq!(seat_tier_discount(9), 0.05);
        assert_eq!(seat_tier_discount(10), 0.07);
        assert_eq!(seat_tier_discount(24), 0.07);
        assert_eq!(seat_tier_discount(25), 0.10);
        assert_eq!(seat_tier_discount(50), 0.12);
        assert_eq!(seat_tier_discount(100), 0.15);
        assert_eq!(seat_tier_discount(5000), 0.15);
    }

    #[test]
    fn rounding_happens_once_at_the_end() {
        // 0.35 * 23 = 8.05 per seat; 150 seats in the 15% tier:
        // 8.05 + 149 * 8.05 * 0.85 = 1027.5825 -> 1027.58
        let price = compute_price(
            23.0,
            Some(&region(Some(0.35))),
            150,
            BillingCycle::Monthly,
            None,
        )
        .unwrap();
        assert_eq!(price, 1027.58);
    }

    #[test]
    fn fixed_coupon_floors_at_zero() {
        let coupon = Coupon {
            code: "WELCOME10".into(),
            kind: CouponKind::Fixed,
            value: 10.0,
            min_purchase: None,
        };
        // $10 off an $8.05 price is $0, never negative
        let price = compute_price(
            23.0,
            Some(&region(Some(0.35))),
            1,
            BillingCycle::Monthly,
            Some(&coupon),
        )
        .unwrap();
        assert_eq!(price, 0.0);
    }

    #[test]
    fn percent_coupon_multiplies_running_total() {
        let coupon = Coupon {
            code: "SAVE20".into(),
            kind: CouponKind::Percent,
            value: 20.0,
            min_purchase: None,
        };
        let price =
            compute_price(23.0, None, 1, BillingCycle::Monthly, Some(&coupon)).unwrap();
        assert_eq!(price, 18.40);
    }

    #[test]
    fn coupon_below_minimum_purchase_is_silently_skipped() {
        let coupon = Coupon {
            code: "BIGSPEND".into(),
            kind: CouponKind::Fixed,
            value: 5.0,
            min_purchase: Some(100.0),
        };
        let price =
            compute_price(23.0, None, 1, BillingCycle::Monthly, Some(&coupon)).unwrap();
        assert_eq!(price, 23.0);
    }

    #[test]
    fn seat_count_must_be_positive() {
        assert!(normalize_seat_count(0.0).is_err());
        assert!(normalize_seat_count(-3.0).is_err());
        assert!(compute_price(23.0, None, 0, BillingCycle::Monthly, None).is_err());
    }

    #[test]
    fn fractional_seats_round_up() {
        assert_eq!(normalize_seat_count(2.1).unwrap(), 3);
        assert_eq!(normalize_seat_count(7.0).unwrap(), 7);
    }

    #[test]
    fn downgrade_proration_issues_credit() {
        // $23/mo -> $9/mo, 10 days into a 30-day cycle:
        // unused credit 23/30*20 = 15.33, new charge 9/30*20 = 6.00,
        // delta -9.33 (credit issued)
        let start = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let now = start + time::Duration::days(10);
        let end = start + time::Duration::days(30);

        let p = prorate(23.0, 9.0, start, end, now);
        assert_eq!(p.days_remaining, 20);
        assert_eq!(p.unused_credit, 15.33);
        assert_eq!(p.new_charge, 6.00);
        assert_eq!(p.delta, -9.33);
    }

    #[test]
    fn upgrade_proration_charges_the_difference() {
        let start = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let now = start + time::Duration::days(15);
        let end = start + time::Duration::days(30);

        let p = prorate(9.0, 23.0, start, end, now);
        assert_eq!(p.days_remaining, 15);
        assert!(p.delta > 0.0);
        assert_eq!(p.delta, round2(p.new_charge - p.unused_credit));
    }

    #[test]
    fn proration_after_period_end_is_zero() {
        let start = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let end = start + time::Duration::days(30);
        let now = end + time::Duration::days(2);

        let p = prorate(23.0, 9.0, start, end, now);
        assert_eq!(p.days_remaining, 0);
        assert_eq!(p.delta, 0.0);
    }
}
