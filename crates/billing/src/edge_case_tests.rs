// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! Boundary conditions across module seams:
//! - Pricing order of operations and coupon interplay
//! - Proration arithmetic
//! - Webhook replay-window and signature layering
//! - Webhook token shape
//! - Gateway event normalization quirks

#[cfg(test)]
mod pricing_order_tests {
    use crate::catalog::{BillingCycle, Coupon, CouponKind, PricingRegion};
    use crate::pricing::{compute_price, round2};

    fn india() -> PricingRegion {
        PricingRegion {
            code: "IN".into(),
            currency: "INR".into(),
            price_multiplier: Some(0.35),
        }
    }

    // =========================================================================
    // Region multiplier applies before seat math, so the discount tier
    // operates on the regional per-seat rate
    // =========================================================================
    #[test]
    fn region_then_seats_then_coupon() {
        // per-seat 23 * 0.35 = 8.05; 10 seats in the 7% tier:
        // 8.05 + 9 * 8.05 * 0.93 = 75.4285; then 10% off = 67.88565 -> 67.89
        let coupon = Coupon {
            code: "SAVE10".into(),
            kind: CouponKind::Percent,
            value: 10.0,
            min_purchase: None,
        };
        let price = compute_price(
            23.0,
            Some(&india()),
            10,
            BillingCycle::Monthly,
            Some(&coupon),
        )
        .unwrap();
        assert_eq!(price, 67.89);
    }

    // =========================================================================
    // Coupon minimum is evaluated against the post-discount running total,
    // not the undiscounted list price
    // =========================================================================
    #[test]
    fn coupon_minimum_sees_discounted_total() {
        let coupon = Coupon {
            code: "OVER20".into(),
            kind: CouponKind::Fixed,
            value: 5.0,
            min_purchase: Some(20.0),
        };
        // regional price 8.05 < 20 minimum: coupon silently skipped
        let price = compute_price(
            23.0,
            Some(&india()),
            1,
            BillingCycle::Monthly,
            Some(&coupon),
        )
        .unwrap();
        assert_eq!(price, 8.05);

        // baseline price 23.0 >= 20 minimum: coupon applies
        let price = compute_price(23.0, None, 1, BillingCycle::Monthly, Some(&coupon)).unwrap();
        assert_eq!(price, 18.0);
    }

    // =========================================================================
    // A 100% coupon empties the invoice without going negative
    // =========================================================================
    #[test]
    fn full_percent_coupon_reaches_exactly_zero() {
        let coupon = Coupon {
            code: "COMP".into(),
            kind: CouponKind::Percent,
            value: 100.0,
            min_purchase: None,
        };
        let price = compute_price(23.0, None, 25, BillingCycle::Monthly, Some(&coupon)).unwrap();
        assert_eq!(price, 0.0);
    }

    // =========================================================================
    // Large seat counts: one final rounding, no per-seat cent drift
    // =========================================================================
    #[test]
    fn thousand_seats_rounds_once() {
        // 8.05 + 999 * 8.05 * 0.85 = 6843.7075 -> 6843.71
        let price =
            compute_price(23.0, Some(&india()), 1000, BillingCycle::Monthly, None).unwrap();
        assert_eq!(price, 6843.71);
        // the naive per-seat rounding would give a different cent value
        let drifted = round2(8.05) + 999.0 * round2(8.05 * 0.85);
        assert_ne!(price, round2(drifted));
    }

    // =========================================================================
    // Yearly billing uses its own base, not monthly / 12
    // =========================================================================
    #[test]
    fn yearly_base_flows_through_unchanged() {
        let price = compute_price(19.0, None, 1, BillingCycle::Yearly, None).unwrap();
        assert_eq!(price, 19.0);
    }
}

#[cfg(test)]
mod proration_tests {
    use crate::pricing::{prorate, Proration};
    use time::{Duration, OffsetDateTime};

    fn period_start() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    // =========================================================================
    // Seat-change proration uses the same daily-rate formula as plan
    // switches: old 23 -> new 46 at day 10 of 30
    // =========================================================================
    #[test]
    fn seat_doubling_mid_cycle() {
        let start = period_start();
        let end = start + Duration::days(30);
        let now = start + Duration::days(10);

        let p = prorate(23.0, 46.0, start, end, now);
        assert_eq!(p.unused_credit, 15.33);
        assert_eq!(p.new_charge, 30.67);
        assert_eq!(p.delta, 15.33);
    }

    // =========================================================================
    // Identical rates produce a zero delta whatever the day
    // =========================================================================
    #[test]
    fn same_rate_is_always_neutral() {
        let start = period_start();
        let end = start + Duration::days(30);
        for day in [0, 1, 15, 29, 30] {
            let p = prorate(23.0, 23.0, start, end, start + Duration::days(day));
            assert_eq!(p.delta, 0.0, "day {day}");
        }
    }

    // =========================================================================
    // Degenerate period (start == end) never divides by zero
    // =========================================================================
    #[test]
    fn zero_length_period_is_neutral() {
        let start = period_start();
        let p = prorate(23.0, 9.0, start, start, start);
        assert_eq!(p.delta, Proration::zero().delta);
        assert_eq!(p.days_remaining, 0);
    }

    // =========================================================================
    // A clock before the period start clamps to the full period
    // =========================================================================
    #[test]
    fn early_clock_clamps_to_full_period() {
        let start = period_start();
        let end = start + Duration::days(30);
        let p = prorate(23.0, 9.0, start, end, start - Duration::days(5));
        assert_eq!(p.days_remaining, 30);
    }
}

#[cfg(test)]
mod webhook_security_tests {
    use crate::config::is_well_formed_webhook_token;
    use crate::webhooks::{validate_timestamp, TimestampCheck, TIMESTAMP_HEADER};
    use http::{HeaderMap, HeaderValue};
    use time::OffsetDateTime;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    // =========================================================================
    // Header absence wins over everything: a request with a perfectly valid
    // signature but no timestamp header must not reach signature checking
    // =========================================================================
    #[test]
    fn missing_timestamp_rejected_before_signature() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "stripe-signature",
            HeaderValue::from_static("t=1700000000,v1=deadbeef"),
        );
        // the provider header's own timestamp cannot substitute
        assert_eq!(
            validate_timestamp(&headers, now()),
            TimestampCheck::Missing
        );
    }

    // =========================================================================
    // Boundary values around the ±300s window
    // =========================================================================
    #[test]
    fn window_edges_are_inclusive() {
        for (offset, expected) in [
            (-300, TimestampCheck::Ok),
            (300, TimestampCheck::Ok),
            (-301, TimestampCheck::OutOfWindow),
            (301, TimestampCheck::OutOfWindow),
            (0, TimestampCheck::Ok),
        ] {
            let mut headers = HeaderMap::new();
            headers.insert(
                TIMESTAMP_HEADER,
                HeaderValue::from_str(&(now().unix_timestamp() + offset).to_string()).unwrap(),
            );
            assert_eq!(validate_timestamp(&headers, now()), expected, "offset {offset}");
        }
    }

    // =========================================================================
    // Empty and whitespace timestamps are malformed, not missing
    // =========================================================================
    #[test]
    fn garbage_timestamps_are_malformed() {
        for bad in ["", " ", "12.5", "+-3", "164e9"] {
            let mut headers = HeaderMap::new();
            headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(bad).unwrap());
            assert_eq!(
                validate_timestamp(&headers, now()),
                TimestampCheck::Malformed,
                "value {bad:?}"
            );
        }
    }

    // =========================================================================
    // Token shape: 64 hex chars exactly; case-sensitivity follows hex digits
    // =========================================================================
    #[test]
    fn token_shape_edges() {
        let lower = "a".repeat(64);
        let upper = "A".repeat(64);
        let mixed = format!("{}{}", "a".repeat(32), "F".repeat(32));
        assert!(is_well_formed_webhook_token(&lower));
        assert!(is_well_formed_webhook_token(&upper));
        assert!(is_well_formed_webhook_token(&mixed));
        assert!(!is_well_formed_webhook_token(&format!("{}!", "a".repeat(63))));
        assert!(!is_well_formed_webhook_token("../../etc/passwd"));
    }
}

#[cfg(test)]
mod gateway_normalization_tests {
    use crate::gateway::{GatewayAdapter, GatewayEventDetail, RazorpayAdapter, StripeAdapter};

    fn stripe() -> StripeAdapter {
        StripeAdapter::new(reqwest::Client::new(), "http://localhost:0".into())
    }

    fn razorpay() -> RazorpayAdapter {
        RazorpayAdapter::new(reqwest::Client::new(), "http://localhost:0".into())
    }

    // =========================================================================
    // A payment intent without latest_charge still yields a payment handle
    // =========================================================================
    #[test]
    fn stripe_capture_without_charge_falls_back_to_intent_id() {
        let body = br#"{
            "id": "evt_nocharge",
            "type": "payment_intent.succeeded",
            "data": {"object": {"id": "pi_77", "amount": 100, "currency": "usd"}}
        }"#;
        let event = stripe().parse_event(body).unwrap();
        match event.detail {
            GatewayEventDetail::PaymentCaptured {
                gateway_payment_id, ..
            } => assert_eq!(gateway_payment_id, "pi_77"),
            other => panic!("unexpected detail: {other:?}"),
        }
    }

    // =========================================================================
    // Failure events surface a human-readable reason even when the provider
    // omits one
    // =========================================================================
    #[test]
    fn failure_reasons_always_present() {
        let body = br#"{
            "id": "evt_f1",
            "type": "payment_intent.payment_failed",
            "data": {"object": {"id": "pi_9", "amount": 100, "currency": "usd"}}
        }"#;
        let event = stripe().parse_event(body).unwrap();
        match event.detail {
            GatewayEventDetail::PaymentFailed { reason, .. } => assert!(!reason.is_empty()),
            other => panic!("unexpected detail: {other:?}"),
        }

        let body = br#"{
            "id": "evt_rzp_f1",
            "event": "payment.failed",
            "payload": {"payment": {"entity": {
                "id": "pay_1", "order_id": "order_1",
                "amount": 100, "currency": "INR"
            }}}
        }"#;
        let event = razorpay().parse_event(body).unwrap();
        match event.detail {
            GatewayEventDetail::PaymentFailed { reason, .. } => assert!(!reason.is_empty()),
            other => panic!("unexpected detail: {other:?}"),
        }
    }

    // =========================================================================
    // Cross-provider event ids never collide at the type level: the
    // (provider, event_id) pair is the identity
    // =========================================================================
    #[test]
    fn providers_keep_their_own_event_id_namespaces() {
        let stripe_event = stripe()
            .parse_event(br#"{"id":"evt_1","type":"x","data":{"object":{}}}"#)
            .unwrap();
        let razorpay_event = razorpay()
            .parse_event(br#"{"id":"evt_1","event":"x","payload":{}}"#)
            .unwrap();
        assert_eq!(stripe_event.event_id, razorpay_event.event_id);
        assert_ne!(stripe_event.provider, razorpay_event.provider);
    }
}
