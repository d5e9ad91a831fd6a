//! Payment gateway abstraction
//!
//! Each provider implements one adapter trait covering order creation,
//! webhook signature verification, refunds, and status queries. Provider
//! payload shapes are decoded at the boundary into per-provider serde types
//! and normalized into a single [`GatewayEvent`] so downstream logic never
//! sees provider-specific JSON.
//!
//! Amounts are always integer minor units (cents/paise). Outbound calls
//! carry an explicit timeout; timeouts and connection failures are transient
//! and retried with exponential backoff, capped at three attempts total.

mod razorpay;
mod stripe;

pub use razorpay::RazorpayAdapter;
pub use stripe::StripeAdapter;

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};

/// Ceiling on outbound gateway call attempts (first try plus retries).
pub const GATEWAY_MAX_ATTEMPTS: usize = 3;

/// Per-request timeout for outbound gateway calls.
pub const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

type HmacSha256 = Hmac<Sha256>;

/// Supported payment gateway providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Stripe,
    Razorpay,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::Stripe => "stripe",
            GatewayKind::Razorpay => "razorpay",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "stripe" => Ok(GatewayKind::Stripe),
            "razorpay" => Ok(GatewayKind::Razorpay),
            other => Err(BillingError::UnknownGateway(other.to_string())),
        }
    }
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Customer details forwarded to the gateway when creating an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerDetails {
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

/// Request to create an order with a gateway.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Tenant-generated, globally unique order id, forwarded to the gateway
    /// as the receipt/reference so webhooks can be correlated back.
    pub internal_order_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub customer: CustomerDetails,
    pub metadata: Option<serde_json::Value>,
}

/// Provider-assigned order handle returned from order creation.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayOrder {
    pub gateway_order_id: String,
    pub amount_cents: i64,
    pub currency: String,
}

/// Outcome of a refund call against the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct RefundOutcome {
    pub gateway_refund_id: String,
    pub amount_cents: i64,
}

/// Normalized order status from a gateway status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Paid,
    Failed,
}

/// A webhook event normalized across providers.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub provider: GatewayKind,
    /// Provider-assigned event id; unique per provider and used as the
    /// deduplication key together with the provider name.
    pub event_id: String,
    pub event_type: String,
    pub detail: GatewayEventDetail,
}

/// Provider-agnostic payload of a webhook event.
#[derive(Debug, Clone)]
pub enum GatewayEventDetail {
    PaymentCaptured {
        gateway_order_id: String,
        gateway_payment_id: String,
        amount_cents: i64,
        currency: String,
    },
    PaymentFailed {
        gateway_order_id: String,
        reason: String,
    },
    RefundProcessed {
        gateway_payment_id: String,
        amount_cents: i64,
        /// Some providers report the cumulative refunded total, others the
        /// amount of this refund alone. The ledger applies each accordingly.
        cumulative: bool,
    },
    /// Event types with no handler; acknowledged and recorded, never an error.
    Unhandled,
}

/// Capability set every payment gateway adapter implements.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Currency allow-list check, uppercase ISO 4217.
    fn supports_currency(&self, currency: &str) -> bool;

    /// Provider-specific minimum charge in minor units.
    fn minimum_amount_cents(&self, currency: &str) -> i64;

    /// Verify the provider signature over the raw request body.
    fn verify_signature(&self, headers: &HeaderMap, raw_body: &[u8], webhook_secret: &str) -> bool;

    /// Decode the provider-native payload into a normalized event.
    fn parse_event(&self, raw_body: &[u8]) -> BillingResult<GatewayEvent>;

    async fn create_order(
        &self,
        config: &GatewayConfig,
        request: &OrderRequest,
    ) -> BillingResult<GatewayOrder>;

    async fn refund(
        &self,
        config: &GatewayConfig,
        gateway_payment_id: &str,
        amount_cents: i64,
        reason: Option<&str>,
    ) -> BillingResult<RefundOutcome>;

    async fn query_status(
        &self,
        config: &GatewayConfig,
        gateway_order_id: &str,
    ) -> BillingResult<OrderStatus>;
}

/// Adapter registry, one instance per provider.
pub struct GatewayRegistry {
    stripe: StripeAdapter,
    razorpay: RazorpayAdapter,
}

impl GatewayRegistry {
    pub fn new(http: reqwest::Client, stripe_base_url: String, razorpay_base_url: String) -> Self {
        Self {
            stripe: StripeAdapter::new(http.clone(), stripe_base_url),
            razorpay: RazorpayAdapter::new(http, razorpay_base_url),
        }
    }

    /// Build a registry against the live provider endpoints. Base URLs can
    /// be overridden via env for staging and tests.
    pub fn from_env() -> Self {
        let stripe_base = std::env::var("STRIPE_API_BASE")
            .unwrap_or_else(|_| "https://api.stripe.com".to_string());
        let razorpay_base = std::env::var("RAZORPAY_API_BASE")
            .unwrap_or_else(|_| "https://api.razorpay.com".to_string());
        Self::new(reqwest::Client::new(), stripe_base, razorpay_base)
    }

    pub fn adapter(&self, kind: GatewayKind) -> &dyn GatewayAdapter {
        match kind {
            GatewayKind::Stripe => &self.stripe,
            GatewayKind::Razorpay => &self.razorpay,
        }
    }
}

/// HMAC-SHA256 over `data`, hex-encoded.
pub(crate) fn hmac_sha256_hex(secret: &str, data: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(data);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison for signature checks.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Run an outbound gateway call with exponential backoff, retrying only
/// transient failures and never exceeding [`GATEWAY_MAX_ATTEMPTS`].
pub(crate) async fn execute_with_retry<T, F, Fut>(call: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = BillingResult<T>>,
{
    let strategy = ExponentialBackoff::from_millis(250)
        .map(jitter)
        .take(GATEWAY_MAX_ATTEMPTS - 1);
    RetryIf::spawn(strategy, call, |e: &BillingError| e.is_transient()).await
}

/// Classify a reqwest transport error: timeouts and connection failures are
/// transient, everything else is a hard gateway rejection.
pub(crate) fn map_transport_error(provider: &'static str, e: reqwest::Error) -> BillingError {
    if e.is_timeout() || e.is_connect() {
        BillingError::gateway_transient(format!("{provider}: {e}"))
    } else {
        BillingError::gateway_rejected(format!("{provider}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_kind_round_trips() {
        assert_eq!(GatewayKind::parse("stripe").unwrap(), GatewayKind::Stripe);
        assert_eq!(
            GatewayKind::parse("razorpay").unwrap(),
            GatewayKind::Razorpay
        );
        assert!(GatewayKind::parse("paypal").is_err());
    }

    #[test]
    fn constant_time_eq_rejects_length_mismatch() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("abc", "abd"));
    }

    #[test]
    fn hmac_hex_is_deterministic() {
        let a = hmac_sha256_hex("secret", b"payload").unwrap();
        let b = hmac_sha256_hex("secret", b"payload").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let c = hmac_sha256_hex("other", b"payload").unwrap();
        assert_ne!(a, c);
    }
}
