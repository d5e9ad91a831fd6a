//! Payment and refund ledger
//!
//! Durable record of every payment attempt, completion, failure, and refund.
//! Status updates are idempotent state-sets so out-of-order webhook delivery
//! cannot regress a record, and the refund bound
//! (`refunded_cents <= amount_cents`) is enforced by a guarded UPDATE in the
//! store rather than an in-process check alone.

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::GatewayConfigStore;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CustomerDetails, GatewayKind, GatewayRegistry, OrderRequest, OrderStatus};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_REFUNDED: &str = "refunded";
pub const STATUS_PARTIALLY_REFUNDED: &str = "partially_refunded";

/// One row in the payment ledger.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub org_id: Uuid,
    pub internal_order_id: String,
    pub provider: String,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub failure_reason: Option<String>,
    pub refunded_cents: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Parameters for creating an order through a tenant's gateway.
#[derive(Debug, Clone)]
pub struct CreateOrderParams {
    pub amount_cents: i64,
    pub currency: String,
    pub customer: CustomerDetails,
    /// Explicit gateway choice; when absent the tenant's default-and-active
    /// config is used.
    pub gateway: Option<GatewayKind>,
    pub metadata: Option<serde_json::Value>,
}

/// Result of a ledger refund.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerRefund {
    pub payment_id: Uuid,
    pub gateway_refund_id: String,
    pub refunded_cents: i64,
    pub total_refunded_cents: i64,
    pub status: String,
}

/// Ledger service: creates orders against gateways and applies state
/// transitions coming back from webhooks and operator calls.
pub struct PaymentService {
    pool: PgPool,
    configs: GatewayConfigStore,
    gateways: Arc<GatewayRegistry>,
}

impl PaymentService {
    pub fn new(pool: PgPool, configs: GatewayConfigStore, gateways: Arc<GatewayRegistry>) -> Self {
        Self {
            pool,
            configs,
            gateways,
        }
    }

    /// Create a pending payment and the matching gateway order.
    ///
    /// Selection policy: an explicit gateway wins, otherwise the tenant's
    /// default active config; no active config is a `NoGatewayConfigured`
    /// error, never a crash.
    pub async fn create_order(
        &self,
        org_id: Uuid,
        params: CreateOrderParams,
    ) -> BillingResult<(Payment, GatewayKind)> {
        if params.amount_cents <= 0 {
            return Err(BillingError::InvalidAmount(params.amount_cents));
        }
        let currency = params.currency.to_uppercase();

        let config = match params.gateway {
            Some(kind) => self.configs.for_provider(org_id, kind).await?,
            None => match self.configs.default_for_org(org_id, Some(&currency)).await {
                Ok(config) => config,
                // no default for this currency class; fall back to the
                // tenant-wide default
                Err(BillingError::NoGatewayConfigured) => {
                    self.configs.default_for_org(org_id, None).await?
                }
                Err(e) => return Err(e),
            },
        };
        let kind = config.kind()?;
        let adapter = self.gateways.adapter(kind);

        if !adapter.supports_currency(&currency) {
            return Err(BillingError::UnsupportedCurrency {
                provider: kind.as_str(),
                currency,
            });
        }
        let minimum = adapter.minimum_amount_cents(&currency);
        if params.amount_cents < minimum {
            return Err(BillingError::AmountBelowMinimum {
                provider: kind.as_str(),
                amount_cents: params.amount_cents,
                minimum_cents: minimum,
            });
        }

        let internal_order_id = format!("order_{}", Uuid::new_v4().simple());

        let payment: Payment = sqlx::query_as(
            r#"
            INSERT INTO payments (org_id, internal_order_id, provider,
                                  amount_cents, currency, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING id, org_id, internal_order_id, provider, gateway_order_id,
                      gateway_payment_id, amount_cents, currency, status,
                      failure_reason, refunded_cents, created_at, updated_at
            "#,
        )
        .bind(org_id)
        .bind(&internal_order_id)
        .bind(kind.as_str())
        .bind(params.amount_cents)
        .bind(&currency)
        .fetch_one(&self.pool)
        .await?;

        let order_request = OrderRequest {
            internal_order_id: internal_order_id.clone(),
            amount_cents: params.amount_cents,
            currency: currency.clone(),
            customer: params.customer,
            metadata: params.metadata,
        };

        let order = match adapter.create_order(&config, &order_request).await {
            Ok(order) => order,
            Err(e) => {
                // keep the ledger honest: the attempt happened and failed
                sqlx::query(
                    "UPDATE payments SET status = 'failed', failure_reason = $2, \
                     updated_at = NOW() WHERE id = $1",
                )
                .bind(payment.id)
                .bind(e.to_string())
                .execute(&self.pool)
                .await?;
                return Err(e);
            }
        };

        sqlx::query("UPDATE payments SET gateway_order_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(payment.id)
            .bind(&order.gateway_order_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            org_id = %org_id,
            internal_order_id = %internal_order_id,
            gateway = %kind,
            gateway_order_id = %order.gateway_order_id,
            amount_cents = params.amount_cents,
            "Created payment order"
        );

        let payment = Payment {
            gateway_order_id: Some(order.gateway_order_id),
            ..payment
        };
        Ok((payment, kind))
    }

    /// Idempotent completion: a late duplicate event re-asserts the same
    /// state, and a refunded payment is never regressed.
    pub async fn mark_completed(
        &self,
        org_id: Uuid,
        provider: GatewayKind,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let payment: Option<Payment> = sqlx::query_as(
            r#"
            UPDATE payments
            SET status = 'completed',
                gateway_payment_id = $4,
                failure_reason = NULL,
                updated_at = NOW()
            WHERE org_id = $1 AND provider = $2 AND gateway_order_id = $3
              AND status IN ('pending', 'failed', 'completed')
            RETURNING id, org_id, internal_order_id, provider, gateway_order_id,
                      gateway_payment_id, amount_cents, currency, status,
                      failure_reason, refunded_cents, created_at, updated_at
            "#,
        )
        .bind(org_id)
        .bind(provider.as_str())
        .bind(gateway_order_id)
        .bind(gateway_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        if payment.is_none() {
            tracing::warn!(
                org_id = %org_id,
                provider = %provider,
                gateway_order_id = %gateway_order_id,
                "Payment completion had no matching updatable row"
            );
        }

        Ok(payment)
    }

    /// Idempotent failure: only a still-pending payment moves to failed, so
    /// an out-of-order failure event after a success is a no-op.
    pub async fn mark_failed(
        &self,
        org_id: Uuid,
        provider: GatewayKind,
        gateway_order_id: &str,
        reason: &str,
    ) -> BillingResult<Option<Payment>> {
        let payment: Option<Payment> = sqlx::query_as(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = $4, updated_at = NOW()
            WHERE org_id = $1 AND provider = $2 AND gateway_order_id = $3
              AND status IN ('pending', 'failed')
            RETURNING id, org_id, internal_order_id, provider, gateway_order_id,
                      gateway_payment_id, amount_cents, currency, status,
                      failure_reason, refunded_cents, created_at, updated_at
            "#,
        )
        .bind(org_id)
        .bind(provider.as_str())
        .bind(gateway_order_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    /// Operator-initiated refund against a completed payment.
    ///
    /// `amount_cents = None` refunds the remaining balance. Cumulative
    /// refunds can never exceed the original amount, and a refund against an
    /// already fully refunded payment is rejected, not silently accepted.
    pub async fn refund(
        &self,
        org_id: Uuid,
        payment_id: Uuid,
        amount_cents: Option<i64>,
        reason: Option<&str>,
    ) -> BillingResult<LedgerRefund> {
        // Scoped lookup: another tenant's payment id behaves exactly like a
        // nonexistent one.
        let payment: Payment = sqlx::query_as(
            r#"
            SELECT id, org_id, internal_order_id, provider, gateway_order_id,
                   gateway_payment_id, amount_cents, currency, status,
                   failure_reason, refunded_cents, created_at, updated_at
            FROM payments
            WHERE id = $1 AND org_id = $2
            "#,
        )
        .bind(payment_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BillingError::PaymentNotFound)?;

        match payment.status.as_str() {
            STATUS_COMPLETED | STATUS_PARTIALLY_REFUNDED => {}
            STATUS_REFUNDED => return Err(BillingError::AlreadyRefunded),
            other => return Err(BillingError::PaymentNotRefundable(other.to_string())),
        }

        let refundable = payment.amount_cents - payment.refunded_cents;
        let requested = amount_cents.unwrap_or(refundable);
        if requested <= 0 {
            return Err(BillingError::InvalidAmount(requested));
        }
        if requested > refundable {
            return Err(BillingError::OverRefund {
                requested_cents: requested,
                refundable_cents: refundable,
            });
        }

        let gateway_payment_id = payment
            .gateway_payment_id
            .as_deref()
            .ok_or_else(|| BillingError::PaymentNotRefundable("missing gateway payment".into()))?;

        let kind = GatewayKind::parse(&payment.provider)?;
        let config = self.configs.for_provider(org_id, kind).await?;
        let outcome = self
            .gateways
            .adapter(kind)
            .refund(&config, gateway_payment_id, requested, reason)
            .await?;

        // Guarded update: the refund bound holds even if a concurrent refund
        // slipped in between the read above and this write.
        let updated: Option<(i64, String)> = sqlx::query_as(
            r#"
            UPDATE payments
            SET refunded_cents = refunded_cents + $2,
                status = CASE
                    WHEN refunded_cents + $2 >= amount_cents THEN 'refunded'
                    ELSE 'partially_refunded'
                END,
                updated_at = NOW()
            WHERE id = $1 AND refunded_cents + $2 <= amount_cents
            RETURNING refunded_cents, status
            "#,
        )
        .bind(payment.id)
        .bind(requested)
        .fetch_optional(&self.pool)
        .await?;

        let (total_refunded_cents, status) = match updated {
            Some(row) => row,
            None => {
                // The gateway accepted the refund but the ledger bound would
                // be violated; surface for manual reconciliation instead of
                // corrupting the ledger.
                tracing::error!(
                    org_id = %org_id,
                    payment_id = %payment.id,
                    gateway_refund_id = %outcome.gateway_refund_id,
                    requested_cents = requested,
                    "RECONCILIATION NEEDED: gateway refund succeeded but ledger bound rejected it"
                );
                return Err(BillingError::OverRefund {
                    requested_cents: requested,
                    refundable_cents: refundable,
                });
            }
        };

        tracing::info!(
            org_id = %org_id,
            payment_id = %payment.id,
            gateway_refund_id = %outcome.gateway_refund_id,
            refunded_cents = requested,
            total_refunded_cents,
            "Refund applied"
        );

        Ok(LedgerRefund {
            payment_id: payment.id,
            gateway_refund_id: outcome.gateway_refund_id,
            refunded_cents: requested,
            total_refunded_cents,
            status,
        })
    }

    /// Apply a refund reported by the gateway via webhook. Cumulative
    /// providers report the running total (applied as a state-set); others
    /// report this refund's amount alone (applied additively, deduplicated
    /// upstream by the event store).
    pub async fn apply_gateway_refund(
        &self,
        org_id: Uuid,
        provider: GatewayKind,
        gateway_payment_id: &str,
        amount_cents: i64,
        cumulative: bool,
    ) -> BillingResult<Option<Payment>> {
        let payment: Option<Payment> = if cumulative {
            sqlx::query_as(
                r#"
                UPDATE payments
                SET refunded_cents = LEAST(amount_cents, GREATEST(refunded_cents, $4)),
                    status = CASE
                        WHEN LEAST(amount_cents, GREATEST(refunded_cents, $4)) >= amount_cents
                            THEN 'refunded'
                        ELSE 'partially_refunded'
                    END,
                    updated_at = NOW()
                WHERE org_id = $1 AND provider = $2 AND gateway_payment_id = $3
                  AND status IN ('completed', 'partially_refunded', 'refunded')
                RETURNING id, org_id, internal_order_id, provider, gateway_order_id,
                          gateway_payment_id, amount_cents, currency, status,
                          failure_reason, refunded_cents, created_at, updated_at
                "#,
            )
            .bind(org_id)
            .bind(provider.as_str())
            .bind(gateway_payment_id)
            .bind(amount_cents)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                UPDATE payments
                SET refunded_cents = refunded_cents + $4,
                    status = CASE
                        WHEN refunded_cents + $4 >= amount_cents THEN 'refunded'
                        ELSE 'partially_refunded'
                    END,
                    updated_at = NOW()
                WHERE org_id = $1 AND provider = $2 AND gateway_payment_id = $3
                  AND status IN ('completed', 'partially_refunded')
                  AND refunded_cents + $4 <= amount_cents
                RETURNING id, org_id, internal_order_id, provider, gateway_order_id,
                          gateway_payment_id, amount_cents, currency, status,
                          failure_reason, refunded_cents, created_at, updated_at
                "#,
            )
            .bind(org_id)
            .bind(provider.as_str())
            .bind(gateway_payment_id)
            .bind(amount_cents)
            .fetch_optional(&self.pool)
            .await?
        };

        if payment.is_none() {
            tracing::warn!(
                org_id = %org_id,
                provider = %provider,
                gateway_payment_id = %gateway_payment_id,
                amount_cents,
                "Gateway refund event had no matching updatable payment"
            );
        }

        Ok(payment)
    }

    /// Scoped read of a payment by its tenant-facing order id. Idempotent:
    /// repeated calls return the same result absent a state change.
    pub async fn get_by_order_id(
        &self,
        org_id: Uuid,
        internal_order_id: &str,
    ) -> BillingResult<Payment> {
        let payment: Option<Payment> = sqlx::query_as(
            r#"
            SELECT id, org_id, internal_order_id, provider, gateway_order_id,
                   gateway_payment_id, amount_cents, currency, status,
                   failure_reason, refunded_cents, created_at, updated_at
            FROM payments
            WHERE org_id = $1 AND internal_order_id = $2
            "#,
        )
        .bind(org_id)
        .bind(internal_order_id)
        .fetch_optional(&self.pool)
        .await?;

        payment.ok_or(BillingError::PaymentNotFound)
    }

    /// Ask the gateway for the live status of an order.
    pub async fn query_gateway_status(
        &self,
        org_id: Uuid,
        internal_order_id: &str,
    ) -> BillingResult<OrderStatus> {
        let payment = self.get_by_order_id(org_id, internal_order_id).await?;
        let kind = GatewayKind::parse(&payment.provider)?;
        let gateway_order_id = payment
            .gateway_order_id
            .as_deref()
            .ok_or(BillingError::PaymentNotFound)?;

        let config = self.configs.for_provider(org_id, kind).await?;
        self.gateways
            .adapter(kind)
            .query_status(&config, gateway_order_id)
            .await
    }
}
