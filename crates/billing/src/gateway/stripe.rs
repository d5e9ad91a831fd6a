//! Stripe-like gateway adapter
//!
//! Signature scheme: the `stripe-signature` header carries
//! `t=<unix>,v1=<hex>` where `v1` is HMAC-SHA256 over `"{t}.{raw_body}"`
//! keyed with the tenant's webhook secret. Orders map to payment intents;
//! the charge id is the payment handle used for refunds.

use async_trait::async_trait;
use http::HeaderMap;
use serde::Deserialize;

use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};

use super::{
    constant_time_eq, execute_with_retry, hmac_sha256_hex, map_transport_error, GatewayAdapter,
    GatewayEvent, GatewayEventDetail, GatewayKind, GatewayOrder, OrderRequest, OrderStatus,
    RefundOutcome, GATEWAY_TIMEOUT,
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

const SUPPORTED_CURRENCIES: &[&str] = &[
    "USD", "EUR", "GBP", "INR", "AUD", "CAD", "SGD", "AED", "JPY", "NZD", "ZAR",
];

pub struct StripeAdapter {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    latest_charge: Option<String>,
    #[serde(default)]
    last_payment_error: Option<StripePaymentError>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeCharge {
    id: String,
    #[serde(default)]
    amount_refunded: i64,
}

#[derive(Debug, Deserialize)]
struct StripeIntentResponse {
    id: String,
    amount: i64,
    currency: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeRefundResponse {
    id: String,
    amount: i64,
}

impl StripeAdapter {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    /// Parse `t=...,v1=...` out of the signature header.
    fn parse_signature_header(value: &str) -> Option<(i64, String)> {
        let mut timestamp = None;
        let mut v1 = None;
        for part in value.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0].trim() {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1 = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }
        Some((timestamp?, v1?))
    }

    fn decode<T: serde::de::DeserializeOwned>(object: &serde_json::Value) -> BillingResult<T> {
        serde_json::from_value(object.clone())
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))
    }
}

#[async_trait]
impl GatewayAdapter for StripeAdapter {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Stripe
    }

    fn supports_currency(&self, currency: &str) -> bool {
        SUPPORTED_CURRENCIES.contains(&currency)
    }

    fn minimum_amount_cents(&self, _currency: &str) -> i64 {
        1
    }

    fn verify_signature(&self, headers: &HeaderMap, raw_body: &[u8], webhook_secret: &str) -> bool {
        let header = match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
            Some(v) => v,
            None => return false,
        };
        let (timestamp, v1) = match Self::parse_signature_header(header) {
            Some(parsed) => parsed,
            None => return false,
        };

        let mut signed_payload = format!("{}.", timestamp).into_bytes();
        signed_payload.extend_from_slice(raw_body);

        match hmac_sha256_hex(webhook_secret, &signed_payload) {
            Some(expected) => constant_time_eq(&expected, &v1),
            None => false,
        }
    }

    fn parse_event(&self, raw_body: &[u8]) -> BillingResult<GatewayEvent> {
        let event: StripeEvent = serde_json::from_slice(raw_body)
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        let detail = match event.event_type.as_str() {
            "payment_intent.succeeded" => {
                let intent: StripePaymentIntent = Self::decode(&event.data.object)?;
                GatewayEventDetail::PaymentCaptured {
                    gateway_payment_id: intent
                        .latest_charge
                        .clone()
                        .unwrap_or_else(|| intent.id.clone()),
                    gateway_order_id: intent.id,
                    amount_cents: intent.amount,
                    currency: intent.currency.to_uppercase(),
                }
            }
            "payment_intent.payment_failed" => {
                let intent: StripePaymentIntent = Self::decode(&event.data.object)?;
                let reason = intent
                    .last_payment_error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "payment failed".to_string());
                GatewayEventDetail::PaymentFailed {
                    gateway_order_id: intent.id,
                    reason,
                }
            }
            "charge.refunded" => {
                let charge: StripeCharge = Self::decode(&event.data.object)?;
                GatewayEventDetail::RefundProcessed {
                    gateway_payment_id: charge.id,
                    // amount_refunded is the running total on the charge
                    amount_cents: charge.amount_refunded,
                    cumulative: true,
                }
            }
            _ => GatewayEventDetail::Unhandled,
        };

        Ok(GatewayEvent {
            provider: GatewayKind::Stripe,
            event_id: event.id,
            event_type: event.event_type,
            detail,
        })
    }

    async fn create_order(
        &self,
        config: &GatewayConfig,
        request: &OrderRequest,
    ) -> BillingResult<GatewayOrder> {
        let url = format!("{}/v1/payment_intents", self.base_url);
        let currency = request.currency.to_lowercase();
        let amount = request.amount_cents.to_string();

        let response: StripeIntentResponse = execute_with_retry(|| {
            let mut form = vec![
                ("amount", amount.clone()),
                ("currency", currency.clone()),
                ("metadata[internal_order_id]", request.internal_order_id.clone()),
                ("receipt_email", request.customer.email.clone()),
            ];
            if let Some(meta) = &request.metadata {
                form.push(("metadata[context]", meta.to_string()));
            }
            let call = self
                .http
                .post(&url)
                .timeout(GATEWAY_TIMEOUT)
                .bearer_auth(&config.api_secret)
                .form(&form)
                .send();
            async move {
                let resp = call.await.map_err(|e| map_transport_error("stripe", e))?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(BillingError::gateway_rejected(format!(
                        "stripe create order returned {status}: {body}"
                    )));
                }
                resp.json::<StripeIntentResponse>()
                    .await
                    .map_err(|e| map_transport_error("stripe", e))
            }
        })
        .await?;

        tracing::info!(
            gateway_order_id = %response.id,
            amount_cents = response.amount,
            currency = %response.currency,
            "Created stripe payment intent"
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
        let url = format!("{}/v1/refunds", self.base_url);
        let amount = amount_cents.to_string();

        let response: StripeRefundResponse = execute_with_retry(|| {
            let mut form = vec![
                ("charge", gateway_payment_id.to_string()),
                ("amount", amount.clone()),
            ];
            if let Some(reason) = reason {
                form.push(("metadata[reason]", reason.to_string()));
            }
            let call = self
                .http
                .post(&url)
                .timeout(GATEWAY_TIMEOUT)
                .bearer_auth(&config.api_secret)
                .form(&form)
                .send();
            async move {
                let resp = call.await.map_err(|e| map_transport_error("stripe", e))?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(BillingError::gateway_rejected(format!(
                        "stripe refund returned {status}: {body}"
                    )));
                }
                resp.json::<StripeRefundResponse>()
                    .await
                    .map_err(|e| map_transport_error("stripe", e))
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
        let url = format!("{}/v1/payment_intents/{}", self.base_url, gateway_order_id);

        let response: StripeIntentResponse = execute_with_retry(|| {
            let call = self
                .http
                .get(&url)
                .timeout(GATEWAY_TIMEOUT)
                .bearer_auth(&config.api_secret)
                .send();
            async move {
                let resp = call.await.map_err(|e| map_transport_error("stripe", e))?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    return Err(BillingError::gateway_rejected(format!(
                        "stripe status query returned {status}"
                    )));
                }
                resp.json::<StripeIntentResponse>()
                    .await
                    .map_err(|e| map_transport_error("stripe", e))
            }
        })
        .await?;

        Ok(match response.status.as_str() {
            "succeeded" => OrderStatus::Paid,
            "canceled" => OrderStatus::Failed,
            _ => OrderStatus::Created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn adapter() -> StripeAdapter {
        StripeAdapter::new(reqwest::Client::new(), "http://localhost:0".to_string())
    }

    fn signed_headers(secret: &str, timestamp: i64, body: &[u8]) -> HeaderMap {
        let mut signed = format!("{}.", timestamp).into_bytes();
        signed.extend_from_slice(body);
        let sig = hmac_sha256_hex(secret, &signed).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&format!("t={},v1={}", timestamp, sig)).unwrap(),
        );
        headers
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
        let headers = signed_headers("whsec_test", 1_700_000_000, body);
        assert!(adapter().verify_signature(&headers, body, "whsec_test"));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let body = br#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
        let headers = signed_headers("whsec_test", 1_700_000_000, body);
        assert!(!adapter().verify_signature(&headers, b"{\"id\":\"evt_2\"}", "whsec_test"));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = br#"{"id":"evt_1"}"#;
        let headers = signed_headers("whsec_test", 1_700_000_000, body);
        assert!(!adapter().verify_signature(&headers, body, "whsec_other"));
    }

    #[test]
    fn missing_header_fails_verification() {
        assert!(!adapter().verify_signature(&HeaderMap::new(), b"{}", "whsec_test"));
    }

    #[test]
    fn payment_succeeded_normalizes_to_captured() {
        let body = br#"{
            "id": "evt_123",
            "type": "payment_intent.succeeded",
            "data": {"object": {
                "id": "pi_42",
                "amount": 51980,
                "currency": "usd",
                "latest_charge": "ch_42"
            }}
        }"#;
        let event = adapter().parse_event(body).unwrap();
        assert_eq!(event.event_id, "evt_123");
        match event.detail {
            GatewayEventDetail::PaymentCaptured {
                gateway_order_id,
                gateway_payment_id,
                amount_cents,
                currency,
            } => {
                assert_eq!(gateway_order_id, "pi_42");
                assert_eq!(gateway_payment_id, "ch_42");
                assert_eq!(amount_cents, 51980);
                assert_eq!(currency, "USD");
            }
            other => panic!("unexpected detail: {other:?}"),
        }
    }

    #[test]
    fn charge_refunded_is_cumulative() {
        let body = br#"{
            "id": "evt_9",
            "type": "charge.refunded",
            "data": {"object": {"id": "ch_42", "amount_refunded": 2300}}
        }"#;
        let event = adapter().parse_event(body).unwrap();
        match event.detail {
            GatewayEventDetail::RefundProcessed {
                amount_cents,
                cumulative,
                ..
            } => {
                assert_eq!(amount_cents, 2300);
                assert!(cumulative);
            }
            other => panic!("unexpected detail: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_unhandled() {
        let body = br#"{"id":"evt_7","type":"customer.created","data":{"object":{}}}"#;
        let event = adapter().parse_event(body).unwrap();
        assert!(matches!(event.detail, GatewayEventDetail::Unhandled));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        assert!(matches!(
            adapter().parse_event(b"not json"),
            Err(BillingError::MalformedPayload(_))
        ));
    }

    #[test]
    fn currency_allow_list() {
        let a = adapter();
        assert!(a.supports_currency("USD"));
        assert!(a.supports_currency("INR"));
        assert!(!a.supports_currency("XYZ"));
    }
}
