//! API error type and HTTP status mapping
//!
//! The mapping follows the error taxonomy of the billing engine: validation
//! and auth failures answer immediately with 4xx, duplicates are a success,
//! missing tenant gateway config is operator-actionable (500), and
//! cross-tenant lookups answer 404 so the existence of another tenant's
//! resource never leaks.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use clinicore_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Billing(#[from] BillingError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Billing(e) => billing_status(e),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        }
    }
}

fn billing_status(e: &BillingError) -> (StatusCode, String) {
    let status = match e {
        // validation errors
        BillingError::InvalidAmount(_)
        | BillingError::InvalidSeatCount(_)
        | BillingError::UnsupportedCurrency { .. }
        | BillingError::AmountBelowMinimum { .. }
        | BillingError::UnknownGateway(_)
        | BillingError::UnknownPlan(_)
        | BillingError::UnknownBillingCycle(_)
        | BillingError::MalformedPayload(_)
        | BillingError::TimestampMissing => StatusCode::BAD_REQUEST,

        // business-invariant violations, rejected synchronously
        BillingError::OverRefund { .. }
        | BillingError::AlreadyRefunded
        | BillingError::PaymentNotRefundable(_)
        | BillingError::InvalidTransition(_) => StatusCode::BAD_REQUEST,

        // auth / replay
        BillingError::SignatureInvalid | BillingError::TimestampOutOfWindow => {
            StatusCode::UNAUTHORIZED
        }

        // cross-tenant and genuinely missing resources both answer 404
        BillingError::PaymentNotFound
        | BillingError::SubscriptionNotFound
        | BillingError::UnknownWebhookToken => StatusCode::NOT_FOUND,

        // operator-actionable
        BillingError::NoGatewayConfigured => StatusCode::INTERNAL_SERVER_ERROR,

        // upstream gateway trouble
        BillingError::Gateway { .. } => StatusCode::BAD_GATEWAY,

        BillingError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        // never leak internals to the caller
        "internal error".to_string()
    } else {
        e.to_string()
    };

    (status, message)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "Request failed");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_refund_is_a_bad_request() {
        let (status, _) = billing_status(&BillingError::OverRefund {
            requested_cents: 100,
            refundable_cents: 50,
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn replay_and_signature_failures_are_unauthorized() {
        assert_eq!(
            billing_status(&BillingError::TimestampOutOfWindow).0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            billing_status(&BillingError::SignatureInvalid).0,
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn missing_timestamp_is_a_bad_request() {
        assert_eq!(
            billing_status(&BillingError::TimestampMissing).0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn cross_tenant_lookups_never_reveal_existence() {
        assert_eq!(
            billing_status(&BillingError::PaymentNotFound).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            billing_status(&BillingError::SubscriptionNotFound).0,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn missing_gateway_config_is_operator_actionable() {
        let (status, message) = billing_status(&BillingError::NoGatewayConfigured);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(message, "internal error");
    }

    #[test]
    fn database_details_are_not_leaked() {
        let (_, message) = billing_status(&BillingError::Database(
            "connection to 10.0.0.5 refused".to_string(),
        ));
        assert!(!message.contains("10.0.0.5"));
    }
}
