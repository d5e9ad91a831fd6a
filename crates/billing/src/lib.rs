// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Config creation takes full credential sets
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clinicore Billing Module
//!
//! The billing and payment-webhook engine for the Clinicore platform.
//!
//! ## Features
//!
//! - **Webhook Security Pipeline**: token, timestamp, and signature layers
//!   in front of an atomic, uniqueness-gated deduplication step
//! - **Gateway Adapters**: Stripe-like and Razorpay-like providers behind
//!   one normalized contract
//! - **Pricing Calculator**: pure multi-factor pricing with regional PPP,
//!   seat volume tiers, coupons, and proration
//! - **Subscription Lifecycle**: plan switches, seat changes, payment-driven
//!   state transitions, trial expiry
//! - **Payment Ledger**: payments, failures, and bounded refunds
//! - **Invariants**: runnable consistency checks over the whole engine

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod payments;
pub mod pricing;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{BillingCycle, CatalogStore, Coupon, CouponKind, PricingRegion, SubscriptionPlan};

// Config
pub use config::{
    generate_webhook_token, is_well_formed_webhook_token, CacheScope, Clock, ConfigCache,
    GatewayConfig, GatewayConfigStore, SystemClock,
};

// Database
pub use db::{create_pool, run_migrations};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{SubscriptionEventLog, SubscriptionEventRecord, SubscriptionEventType};

// Gateway
pub use gateway::{
    CustomerDetails, GatewayAdapter, GatewayEvent, GatewayEventDetail, GatewayKind, GatewayOrder,
    GatewayRegistry, OrderRequest, OrderStatus, RefundOutcome,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Payments
pub use payments::{CreateOrderParams, LedgerRefund, Payment, PaymentService};

// Pricing
pub use pricing::{compute_price, normalize_seat_count, prorate, round2, Proration};

// Subscriptions
pub use subscriptions::{
    PlanChange, PlatformSubscription, SeatChange, SubscriptionService, MAX_FAILED_PAYMENTS,
};

// Webhooks
pub use webhooks::{
    validate_timestamp, TimestampCheck, WebhookEventRecord, WebhookPipeline, WebhookReply,
    MAX_PROCESSING_ATTEMPTS, TIMESTAMP_HEADER, TIMESTAMP_TOLERANCE_SECS,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: CatalogStore,
    pub configs: GatewayConfigStore,
    pub gateways: Arc<GatewayRegistry>,
    pub events: SubscriptionEventLog,
    pub payments: Arc<PaymentService>,
    pub subscriptions: Arc<SubscriptionService>,
    pub webhooks: WebhookPipeline,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a billing service with gateway endpoints taken from the
    /// environment and the system clock.
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(pool, Arc::new(GatewayRegistry::from_env()), Arc::new(SystemClock))
    }

    /// Create a billing service with explicit collaborators (tests inject a
    /// fixed clock and mock gateway endpoints here).
    pub fn new(pool: PgPool, gateways: Arc<GatewayRegistry>, clock: Arc<dyn Clock>) -> Self {
        let catalog = CatalogStore::new(pool.clone());
        let configs = GatewayConfigStore::new(pool.clone(), clock.clone());
        let events = SubscriptionEventLog::new(pool.clone());
        let payments = Arc::new(PaymentService::new(
            pool.clone(),
            configs.clone(),
            gateways.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            pool.clone(),
            catalog.clone(),
            events.clone(),
            clock.clone(),
        ));
        let webhooks = WebhookPipeline::new(
            pool.clone(),
            configs.clone(),
            gateways.clone(),
            payments.clone(),
            subscriptions.clone(),
            clock,
        );
        let invariants = InvariantChecker::new(pool);

        Self {
            catalog,
            configs,
            gateways,
            events,
            payments,
            subscriptions,
            webhooks,
            invariants,
        }
    }
}
