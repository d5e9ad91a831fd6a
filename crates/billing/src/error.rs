//! Billing error taxonomy
//!
//! Validation and auth failures surface immediately to the caller with no
//! retry. Gateway failures carry a `transient` flag; only transient ones are
//! eligible for the capped retry path. Business-invariant violations
//! (over-refund, invalid transition) are always rejected synchronously.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(String),

    // Webhook security pipeline
    #[error("unknown webhook token")]
    UnknownWebhookToken,
    #[error("webhook timestamp header required")]
    TimestampMissing,
    #[error("webhook timestamp outside the allowed window")]
    TimestampOutOfWindow,
    #[error("webhook signature invalid")]
    SignatureInvalid,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    // Gateway adapters
    #[error("no active payment gateway configured for tenant")]
    NoGatewayConfigured,
    #[error("unknown payment gateway: {0}")]
    UnknownGateway(String),
    #[error("currency {currency} not supported by {provider}")]
    UnsupportedCurrency { provider: &'static str, currency: String },
    #[error("amount {amount_cents} below {provider} minimum of {minimum_cents} minor units")]
    AmountBelowMinimum {
        provider: &'static str,
        amount_cents: i64,
        minimum_cents: i64,
    },
    #[error("gateway error: {message}")]
    Gateway { message: String, transient: bool },

    // Ledger
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),
    #[error("payment not found")]
    PaymentNotFound,
    #[error("refund of {requested_cents} exceeds refundable {refundable_cents}")]
    OverRefund {
        requested_cents: i64,
        refundable_cents: i64,
    },
    #[error("payment already fully refunded")]
    AlreadyRefunded,
    #[error("refund requires a completed payment (status is {0})")]
    PaymentNotRefundable(String),

    // Pricing / lifecycle
    #[error("invalid seat count: {0}")]
    InvalidSeatCount(i64),
    #[error("unknown plan: {0}")]
    UnknownPlan(String),
    #[error("unknown billing cycle: {0}")]
    UnknownBillingCycle(String),
    #[error("invalid subscription transition: {0}")]
    InvalidTransition(String),
    #[error("subscription not found")]
    SubscriptionNotFound,
}

impl BillingError {
    /// Transient errors are eligible for the capped retry path; everything
    /// else fails immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            BillingError::Gateway { transient, .. } => *transient,
            BillingError::Database(_) => true,
            _ => false,
        }
    }

    pub fn gateway_transient(message: impl Into<String>) -> Self {
        BillingError::Gateway {
            message: message.into(),
            transient: true,
        }
    }

    pub fn gateway_rejected(message: impl Into<String>) -> Self {
        BillingError::Gateway {
            message: message.into(),
            transient: false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}
