//! Webhook security pipeline
//!
//! Sequential, independently-failing layers over every inbound gateway
//! callback; a rejection at any layer is terminal and later layers never
//! run:
//!
//! 1. token lookup — unknown or malformed token answers 404, leaking nothing
//!    beyond "exists"
//! 2. timestamp validation — the `x-webhook-timestamp` header is mandatory
//!    (400 when absent, regardless of any provider header) and must be
//!    within ±300 seconds of server time (401 otherwise)
//! 3. provider signature over the raw body (401 on mismatch)
//! 4. atomic deduplication — a single INSERT guarded by the unique
//!    constraint on (provider, event_id); the insert is the only concurrency
//!    gate, which is what still works when deliveries land on different
//!    instances. Losers answer 200 "already processed" and mutate nothing.
//! 5. dispatch — only the insert winner applies ledger and lifecycle
//!    updates and marks the event processed.
//!
//! Processing failures after a won insert mark the event `failed` with an
//! incremented retry count, capped at [`MAX_PROCESSING_ATTEMPTS`]; beyond
//! the cap the event is permanently failed and surfaced to the operator
//! queue. It is never silently dropped and never retried past the cap.

use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::{Clock, GatewayConfig, GatewayConfigStore};
use crate::error::BillingResult;
use crate::gateway::{GatewayEvent, GatewayEventDetail, GatewayKind, GatewayRegistry};
use crate::payments::PaymentService;
use crate::subscriptions::SubscriptionService;

/// Replay window for the bespoke timestamp header, in seconds.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Name of the mandatory timestamp header.
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// Total processing attempts per accepted event (first run plus retries).
pub const MAX_PROCESSING_ATTEMPTS: i32 = 3;

/// HTTP-shaped pipeline verdict: status code plus a terse body.
pub type WebhookReply = (StatusCode, &'static str);

/// Stored webhook event row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub org_id: Uuid,
    pub status: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Outcome of the timestamp layer, split out so it is unit-testable
/// without a pipeline.
#[derive(Debug, PartialEq, Eq)]
pub enum TimestampCheck {
    Ok,
    Missing,
    Malformed,
    OutOfWindow,
}

/// Validate the bespoke timestamp header against the given server time.
///
/// Absence is rejected before anything else so a stripped header can never
/// downgrade a request to no replay protection.
pub fn validate_timestamp(headers: &HeaderMap, now: OffsetDateTime) -> TimestampCheck {
    let raw = match headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok()) {
        Some(v) => v,
        None => return TimestampCheck::Missing,
    };
    let timestamp: i64 = match raw.trim().parse() {
        Ok(t) => t,
        Err(_) => return TimestampCheck::Malformed,
    };

    let skew = (now.unix_timestamp() - timestamp).abs();
    if skew > TIMESTAMP_TOLERANCE_SECS {
        return TimestampCheck::OutOfWindow;
    }
    TimestampCheck::Ok
}

pub struct WebhookPipeline {
    pool: PgPool,
    configs: GatewayConfigStore,
    gateways: Arc<GatewayRegistry>,
    payments: Arc<PaymentService>,
    subscriptions: Arc<SubscriptionService>,
    clock: Arc<dyn Clock>,
}

impl WebhookPipeline {
    pub fn new(
        pool: PgPool,
        configs: GatewayConfigStore,
        gateways: Arc<GatewayRegistry>,
        payments: Arc<PaymentService>,
        subscriptions: Arc<SubscriptionService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            configs,
            gateways,
            payments,
            subscriptions,
            clock,
        }
    }

    /// Run the full pipeline for one delivery. Always returns fast with a
    /// definite HTTP verdict; N concurrent deliveries of the same event all
    /// get 200 while exactly one applies the side effects.
    pub async fn handle(&self, token: &str, headers: &HeaderMap, raw_body: &[u8]) -> WebhookReply {
        // Layer 1: token lookup
        let config = match self.configs.resolve_by_token(token).await {
            Ok(Some(config)) => config,
            Ok(None) => return (StatusCode::NOT_FOUND, "not found"),
            Err(e) => {
                tracing::error!(error = %e, "Webhook token lookup failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };

        // Layer 2: mandatory timestamp, then window
        match validate_timestamp(headers, self.clock.now()) {
            TimestampCheck::Ok => {}
            TimestampCheck::Missing => return (StatusCode::BAD_REQUEST, "timestamp required"),
            TimestampCheck::Malformed => return (StatusCode::BAD_REQUEST, "invalid timestamp"),
            TimestampCheck::OutOfWindow => {
                tracing::warn!(
                    org_id = %config.org_id,
                    provider = %config.provider,
                    "Webhook timestamp outside replay window"
                );
                return (StatusCode::UNAUTHORIZED, "timestamp out of window");
            }
        }

        let kind = match config.kind() {
            Ok(kind) => kind,
            Err(e) => {
                tracing::error!(
                    org_id = %config.org_id,
                    provider = %config.provider,
                    error = %e,
                    "Gateway config carries an unknown provider"
                );
                return (StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };
        let adapter = self.gateways.adapter(kind);

        // Layer 3: provider signature over the raw body
        if !adapter.verify_signature(headers, raw_body, &config.webhook_secret) {
            tracing::warn!(
                org_id = %config.org_id,
                provider = %kind,
                "Webhook signature verification failed"
            );
            return (StatusCode::UNAUTHORIZED, "invalid signature");
        }

        let event = match adapter.parse_event(raw_body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    org_id = %config.org_id,
                    provider = %kind,
                    error = %e,
                    "Webhook payload failed to parse"
                );
                return (StatusCode::BAD_REQUEST, "malformed payload");
            }
        };

        // Layer 4: atomic deduplication. The unique constraint decides the
        // winner; everyone else sees a duplicate and stops.
        let claimed = match self.claim_event(&config, &event, raw_body).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(
                    org_id = %config.org_id,
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to claim webhook event"
                );
                return (StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };

        let row_id = match claimed {
            Some(id) => id,
            None => {
                tracing::info!(
                    org_id = %config.org_id,
                    provider = %kind,
                    event_id = %event.event_id,
                    "Duplicate webhook event"
                );
                return (StatusCode::OK, "already processed");
            }
        };

        // Layer 5: dispatch, winner only
        match self.apply_event(&config, &event).await {
            Ok(()) => {
                if let Err(e) = self.mark_processed(row_id).await {
                    tracing::error!(
                        event_id = %event.event_id,
                        error = %e,
                        "Event applied but could not be marked processed"
                    );
                }
                (StatusCode::OK, "processed")
            }
            Err(e) => {
                tracing::error!(
                    org_id = %config.org_id,
                    event_id = %event.event_id,
                    error = %e,
                    "Webhook event processing failed; queued for retry"
                );
                if let Err(mark_err) = self.mark_failed(row_id, &e.to_string()).await {
                    tracing::error!(
                        event_id = %event.event_id,
                        error = %mark_err,
                        "Failed to record webhook processing failure"
                    );
                }
                // the event is accepted and owned by the retry queue now;
                // the delivery itself still succeeds
                (StatusCode::OK, "accepted")
            }
        }
    }

    /// Insert-or-lose: returns the new row id when this request won the
    /// unique-constraint race, `None` when the event already exists.
    async fn claim_event(
        &self,
        config: &GatewayConfig,
        event: &GatewayEvent,
        raw_body: &[u8],
    ) -> BillingResult<Option<Uuid>> {
        let payload = String::from_utf8_lossy(raw_body);
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (provider, event_id, event_type, org_id, payload, status)
            VALUES ($1, $2, $3, $4, $5, 'processing')
            ON CONFLICT (provider, event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event.provider.as_str())
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(config.org_id)
        .bind(payload.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.map(|(id,)| id))
    }

    /// Apply the business-logic side effect of a normalized event. Each arm
    /// is an idempotent state-set, so ordering between events is irrelevant.
    async fn apply_event(&self, config: &GatewayConfig, event: &GatewayEvent) -> BillingResult<()> {
        match &event.detail {
            GatewayEventDetail::PaymentCaptured {
                gateway_order_id,
                gateway_payment_id,
                amount_cents,
                currency,
            } => {
                let payment = self
                    .payments
                    .mark_completed(
                        config.org_id,
                        event.provider,
                        gateway_order_id,
                        gateway_payment_id,
                    )
                    .await?;

                if let Some(payment) = &payment {
                    if payment.amount_cents != *amount_cents || payment.currency != *currency {
                        tracing::warn!(
                            org_id = %config.org_id,
                            payment_id = %payment.id,
                            ledger_amount = payment.amount_cents,
                            event_amount = amount_cents,
                            "Captured amount differs from ledger"
                        );
                    }
                }

                self.subscriptions.on_payment_succeeded(config.org_id).await
            }
            GatewayEventDetail::PaymentFailed {
                gateway_order_id,
                reason,
            } => {
                self.payments
                    .mark_failed(config.org_id, event.provider, gateway_order_id, reason)
                    .await?;
                self.subscriptions
                    .on_payment_failed(config.org_id, reason)
                    .await
            }
            GatewayEventDetail::RefundProcessed {
                gateway_payment_id,
                amount_cents,
                cumulative,
            } => {
                self.payments
                    .apply_gateway_refund(
                        config.org_id,
                        event.provider,
                        gateway_payment_id,
                        *amount_cents,
                        *cumulative,
                    )
                    .await?;
                Ok(())
            }
            GatewayEventDetail::Unhandled => {
                tracing::info!(
                    org_id = %config.org_id,
                    provider = %event.provider,
                    event_type = %event.event_type,
                    "Received unhandled gateway event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    async fn mark_processed(&self, row_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_events SET status = 'processed', processed_at = NOW() WHERE id = $1",
        )
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, row_id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed', retry_count = retry_count + 1, last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(row_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-run failed events that still have attempts left. Called from the
    /// worker; each retry re-parses the verbatim payload and replays the
    /// dispatch step only (the delivery already won its insert).
    pub async fn retry_failed_events(&self, batch_size: i64) -> BillingResult<u64> {
        let candidates: Vec<(Uuid, String, String, Uuid)> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET status = 'processing'
            WHERE id IN (
                SELECT id FROM webhook_events
                WHERE status = 'failed' AND retry_count < $1
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, provider, payload, org_id
            "#,
        )
        .bind(MAX_PROCESSING_ATTEMPTS)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0u64;
        for (row_id, provider, payload, org_id) in candidates {
            let outcome = self
                .replay_event(row_id, &provider, payload.as_bytes(), org_id)
                .await;
            match outcome {
                Ok(()) => recovered += 1,
                Err(e) => {
                    tracing::warn!(
                        webhook_event_id = %row_id,
                        error = %e,
                        "Webhook retry failed"
                    );
                    self.mark_failed(row_id, &e.to_string()).await?;
                }
            }
        }

        Ok(recovered)
    }

    async fn replay_event(
        &self,
        row_id: Uuid,
        provider: &str,
        payload: &[u8],
        org_id: Uuid,
    ) -> BillingResult<()> {
        let kind = GatewayKind::parse(provider)?;
        let event = self.gateways.adapter(kind).parse_event(payload)?;

        let config = self.configs.for_provider(org_id, kind).await?;

        self.apply_event(&config, &event).await?;
        self.mark_processed(row_id).await
    }

    /// Events that exhausted their attempts: the operator queue. Never
    /// retried automatically, never dropped.
    pub async fn permanently_failed_events(
        &self,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let events = sqlx::query_as(
            r#"
            SELECT id, provider, event_id, event_type, org_id, status,
                   retry_count, last_error, processed_at, created_at
            FROM webhook_events
            WHERE status = 'failed' AND retry_count >= $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(MAX_PROCESSING_ATTEMPTS)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with_timestamp(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn missing_timestamp_is_rejected_outright() {
        assert_eq!(
            validate_timestamp(&HeaderMap::new(), now()),
            TimestampCheck::Missing
        );
    }

    #[test]
    fn unparseable_timestamp_is_malformed() {
        let headers = headers_with_timestamp("not-a-number");
        assert_eq!(validate_timestamp(&headers, now()), TimestampCheck::Malformed);
    }

    #[test]
    fn timestamp_within_window_passes() {
        let headers = headers_with_timestamp(&(now().unix_timestamp() - 120).to_string());
        assert_eq!(validate_timestamp(&headers, now()), TimestampCheck::Ok);
    }

    #[test]
    fn timestamp_at_window_edge_passes() {
        let headers = headers_with_timestamp(&(now().unix_timestamp() - 300).to_string());
        assert_eq!(validate_timestamp(&headers, now()), TimestampCheck::Ok);
    }

    #[test]
    fn stale_timestamp_is_out_of_window() {
        let headers = headers_with_timestamp(&(now().unix_timestamp() - 301).to_string());
        assert_eq!(
            validate_timestamp(&headers, now()),
            TimestampCheck::OutOfWindow
        );
    }

    #[test]
    fn future_timestamp_is_out_of_window() {
        // forged future timestamps are rejected the same as stale ones
        let headers = headers_with_timestamp(&(now().unix_timestamp() + 301).to_string());
        assert_eq!(
            validate_timestamp(&headers, now()),
            TimestampCheck::OutOfWindow
        );
    }
}
