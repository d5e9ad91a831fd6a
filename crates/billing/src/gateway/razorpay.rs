//! Razorpay-like gateway adapter
//!
//! Signature scheme: the `x-razorpay-signature` header is HMAC-SHA256 over
//! the raw body, hex-encoded, keyed with the tenant's webhook secret.
//! INR-only, with a provider minimum of 100 minor units (one rupee).

use async_trait::async_trait;
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};

use super::{
    constant_time_eq, execute_with_retry, hmac_sha256_hex, map_transport_error, GatewayAdapter,
    GatewayEvent, GatewayEventDetail, GatewayKind, GatewayOrder, OrderRequest, OrderStatus,
    RefundOutcome, GATEWAY_TIMEOUT,
};

pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";

/// Minimum order amount in paise.
pub const MINIMUM_AMOUNT_PAISE: i64 = 100;

pub struct RazorpayAdapter {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayEvent {
    id: String,
    event: String,
    payload: RazorpayPayload,
}

#[derive(Debug, Default, Deserialize)]
struct RazorpayPayload {
    #[serde(default)]
    payment: Option<RazorpayEntity<RazorpayPayment>>,
    #[serde(default)]
    refund: Option<RazorpayEntity<RazorpayRefund>>,
}

#[derive(Debug, Deserialize)]
struct RazorpayEntity<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct RazorpayPayment {
    id: String,
    order_id: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RazorpayRefund {
    #[allow(dead_code)]
    id: String,
    payment_id: String,
    amount: i64,
}

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrderResponse {
    id: String,
    amount: i64,
    currency: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayRefundResponse {
    id: String,
    amount: i64,
}

impl RazorpayAdapter {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }
}

#[async_trait]
impl GatewayAdapter for RazorpayAdapter {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Razorpay
    }

    fn supports_currency(&self, currency: &str) -> bool {
        currency == "INR"
    }

    fn minimum_amount_cents(&self, _currency: &str) -> i64 {
        MINIMUM_AMOUNT_PAISE
    }

    fn verify_signature(&self, headers: &HeaderMap, raw_body: &[u8], webhook_secret: &str) -> bool {
        let signature = match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
            Some(v) => v,
            None => return false,
        };
        match hmac_sha256_hex(webhook_secret, raw_body) {
            Some(expected) => constant_time_eq(&expected, signature),
            None => false,
        }
    }

    fn parse_event(&self, raw_body: &[u8]) -> BillingResult<GatewayEvent> {
        let event: RazorpayEvent = serde_json::from_slice(raw_body)
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        let detail = match event.event.as_str() {
            "payment.captured" => {
                let payment = event
                    .payload
                    .payment
                    .ok_or_else(|| {
                        BillingError::MalformedPayload("payment.captured without payment".into())
                    })?
                    .entity;
                GatewayEventDetail::PaymentCaptured {
                    gateway_order_id: payment.order_id,
                    gateway_payment_id: payment.id,
                    amount_cents: payment.amount,
                    currency: payment.currency.to_uppercase(),
                }
            }
            "payment.failed" => {
                let payment = event
                    .payload
                    .payment
                    .ok_or_else(|| {
                        BillingError::MalformedPayload("payment.failed without payment".into())
                    })?
                    .entity;
                GatewayEventDetail::PaymentFailed {
                    gateway_order_id: payment.order_id,
                    reason: payment
                        .error_description
                        .unwrap_or_else(|| "payment failed".to_string()),
                }
            }
            "refund.processed" => {
                let refund = event
                    .payload
                    .refund
                    .ok_or_else(|| {
                        BillingError::MalformedPayload("refund.processed without refund".into())
                    })?
                    .entity;
                GatewayEventDetail::RefundProcessed {
                    gateway_payment_id: refund.payment_id,
                    // each refund event carries this refund's amount only
                    amount_cents: refund.amount,
                    cumulative: false,
                }
            }
            _ => GatewayEventDetail::Unhandled,
        };

        Ok(GatewayEvent {
            provider: GatewayKind::Razorpay,
            event_id: event.id,
            event_type: event.event,
            detail,
        })
    }

    async fn create_order(
        &self,
        config: &GatewayConfig,
        request: &OrderRequest,
    ) -> BillingResult<GatewayOrder> {
        let url = format!("{}/v1/orders", self.base_url);

        let response: RazorpayOrderResponse = execute_with_retry(|| {
            let body = CreateOrderBody {
                amount: request.amount_cents,
                currency: &request.currency,
                receipt: &request.internal_order_id,
                notes: request.metadata.as_ref(),
            };
            let call = self
                .http
                .post(&url)
                .timeout(GATEWAY_TIMEOUT)
                .basic_auth(&config.api_key, Some(&config.api_secret))
                .json(&body)
                .send();
            async move {
                let resp = call.await.map_err(|e| map_transport_error("razorpay", e))?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(BillingError::gateway_rejected(format!(
                        "razorpay create order returned {status}: {body}"
                    )));
                }
                resp.json::<RazorpayOrderResponse>()
                    .await
                    .map_err(|e| map_transport_error("razorpay", e))
            }
        })
        .await?;

        tracing::info!(
            gateway_order_id = %response.id,
            amount_cents = response.amount,
            currency = %response.currency,
            "Created razorpay order"
        );

        Ok(GatewayOrder {
            gateway_order_id: response.id,
            amount_cents: response.amount,
            currency: response.currency.to_uppercase(),
        })
    }

    async fn refund(
        &self,
        config: &GatewayConfig,
        gateway_payment_id: &str,
        amount_cents: i64,
        reason: Option<&str>,
    ) -> BillingResult<RefundOutcome> {
        let url = format!("{}/v1/payments/{}/refund", self.base_url, gateway_payment_id);

        let response: RazorpayRefundResponse = execute_with_retry(|| {
            let mut body = serde_json::json!({ "amount": amount_cents });
            if let Some(reason) = reason {
                body["notes"] = serde_json::json!({ "reason": reason });
            }
            let call = self
                .http
                .post(&url)
                .timeout(GATEWAY_TIMEOUT)
                .basic_auth(&config.api_key, Some(&config.api_secret))
                .json(&body)
                .send();
            async move {
                let resp = call.await.map_err(|e| map_transport_error("razorpay", e))?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(BillingError::gateway_rejected(format!(
                        "razorpay refund returned {status}: {body}"
                    )));
                }
                resp.json::<RazorpayRefundResponse>()
                    .await
                    .map_err(|e| map_transport_error("razorpay", e))
            }
        })
        .await?;

        Ok(RefundOutcome {
            gateway_refund_id: response.id,
            amount_cents: response.amount,
        })
    }

    async fn query_status(
        &self,
        config: &GatewayConfig,
        gateway_order_id: &str,
    ) -> BillingResult<OrderStatus> {
        let url = format!("{}/v1/orders/{}", self.base_url, gateway_order_id);

        let response: RazorpayOrderResponse = execute_with_retry(|| {
            let call = self
                .http
                .get(&url)
                .timeout(GATEWAY_TIMEOUT)
                .basic_auth(&config.api_key, Some(&config.api_secret))
                .send();
            async move {
                let resp = call.await.map_err(|e| map_transport_error("razorpay", e))?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    return Err(BillingError::gateway_rejected(format!(
                        "razorpay status query returned {status}"
                    )));
                }
                resp.json::<RazorpayOrderResponse>()
                    .await
                    .map_err(|e| map_transport_error("razorpay", e))
            }
        })
        .await?;

        Ok(match response.status.as_str() {
            "paid" => OrderStatus::Paid,
            "failed" => OrderStatus::Failed,
            _ => OrderStatus::Created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn adapter() -> RazorpayAdapter {
        RazorpayAdapter::new(reqwest::Client::new(), "http://localhost:0".to_string())
    }

    fn signed_headers(secret: &str, body: &[u8]) -> HeaderMap {
        let sig = hmac_sha256_hex(secret, body).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sig).unwrap());
        headers
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"id":"evt_rzp_1","event":"payment.captured","payload":{}}"#;
        let headers = signed_headers("rzp_secret", body);
        assert!(adapter().verify_signature(&headers, body, "rzp_secret"));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let body = br#"{"id":"evt_rzp_1"}"#;
        let headers = signed_headers("rzp_secret", body);
        assert!(!adapter().verify_signature(&headers, br#"{"id":"evt_rzp_2"}"#, "rzp_secret"));
    }

    #[test]
    fn payment_captured_normalizes() {
        let body = br#"{
            "id": "evt_rzp_5",
            "event": "payment.captured",
            "payload": {"payment": {"entity": {
                "id": "pay_99",
                "order_id": "order_77",
                "amount": 80500,
                "currency": "INR"
            }}}
        }"#;
        let event = adapter().parse_event(body).unwrap();
        assert_eq!(event.event_id, "evt_rzp_5");
        match event.detail {
            GatewayEventDetail::PaymentCaptured {
                gateway_order_id,
                gateway_payment_id,
                amount_cents,
                currency,
            } => {
                assert_eq!(gateway_order_id, "order_77");
                assert_eq!(gateway_payment_id, "pay_99");
                assert_eq!(amount_cents, 80500);
                assert_eq!(currency, "INR");
            }
            other => panic!("unexpected detail: {other:?}"),
        }
    }

    #[test]
    fn refund_processed_is_per_refund() {
        let body = br#"{
            "id": "evt_rzp_8",
            "event": "refund.processed",
            "payload": {"refund": {"entity": {
                "id": "rfnd_3",
                "payment_id": "pay_99",
                "amount": 10000
            }}}
        }"#;
        let event = adapter().parse_event(body).unwrap();
        match event.detail {
            GatewayEventDetail::RefundProcessed {
                gateway_payment_id,
                amount_cents,
                cumulative,
            } => {
                assert_eq!(gateway_payment_id, "pay_99");
                assert_eq!(amount_cents, 10000);
                assert!(!cumulative);
            }
            other => panic!("unexpected detail: {other:?}"),
        }
    }

    #[test]
    fn captured_event_without_payment_is_malformed() {
        let body = br#"{"id":"evt_rzp_9","event":"payment.captured","payload":{}}"#;
        assert!(matches!(
            adapter().parse_event(body),
            Err(BillingError::MalformedPayload(_))
        ));
    }

    #[test]
    fn inr_only_with_minimum() {
        let a = adapter();
        assert!(a.supports_currency("INR"));
        assert!(!a.supports_currency("USD"));
        assert_eq!(a.minimum_amount_cents("INR"), 100);
    }

    #[tokio::test]
    async fn create_order_round_trip_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/orders")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"order_mock1","amount":80500,"currency":"INR","status":"created"}"#,
            )
            .create_async()
            .await;

        let adapter = RazorpayAdapter::new(reqwest::Client::new(), server.url());
        let config = crate::config::GatewayConfig::for_tests(GatewayKind::Razorpay);
        let request = OrderRequest {
            internal_order_id: "order_internal_1".to_string(),
            amount_cents: 80500,
            currency: "INR".to_string(),
            customer: crate::gateway::CustomerDetails {
                name: "Asha Clinic".to_string(),
                email: "billing@asha.example".to_string(),
                contact: None,
            },
            metadata: None,
        };

        let order = adapter.create_order(&config, &request).await.unwrap();
        assert_eq!(order.gateway_order_id, "order_mock1");
        assert_eq!(order.amount_cents, 80500);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_order_is_not_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/orders")
            .with_status(400)
            .with_body(r#"{"error":{"description":"amount too small"}}"#)
            .create_async()
            .await;

        let adapter = RazorpayAdapter::new(reqwest::Client::new(), server.url());
        let config = crate::config::GatewayConfig::for_tests(GatewayKind::Razorpay);
        let request = OrderRequest {
            internal_order_id: "order_internal_2".to_string(),
            amount_cents: 1,
            currency: "INR".to_string(),
            customer: crate::gateway::CustomerDetails {
                name: "Asha Clinic".to_string(),
                email: "billing@asha.example".to_string(),
                contact: None,
            },
            metadata: None,
        };

        let err = adapter.create_order(&config, &request).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
