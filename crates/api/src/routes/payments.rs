//! Payment routes: order creation, refunds, status

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clinicore_billing::{CreateOrderParams, CustomerDetails, GatewayKind};

use crate::auth::AuthedTenant;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerPayload {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub contact: Option<String>,
}

/// Request to create a payment order
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    /// Amount in minor units (cents/paise), must be positive
    pub amount: i64,
    /// ISO currency code, validated against the gateway's allow-list
    pub currency: String,
    pub customer: CustomerPayload,
    /// Explicit gateway; omitted means the tenant default
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInfo {
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order: OrderInfo,
    pub gateway: String,
}

/// Request to refund a payment
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub payment_id: Uuid,
    /// Minor units; omitted means the full remaining balance
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResponse {
    pub payment_id: Uuid,
    pub refunded: i64,
    pub total_refunded: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusResponse {
    pub order_id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub refunded: i64,
    pub failure_reason: Option<String>,
    /// Live status from the gateway, queried only while the ledger still
    /// says pending (webhooks are the source of truth afterwards).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_status: Option<String>,
}

/// Create an order through the tenant's gateway
pub async fn create_order(
    State(state): State<AppState>,
    tenant: AuthedTenant,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<(StatusCode, Json<CreateOrderResponse>)> {
    let gateway = req
        .gateway
        .as_deref()
        .map(GatewayKind::parse)
        .transpose()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let params = CreateOrderParams {
        amount_cents: req.amount,
        currency: req.currency,
        customer: CustomerDetails {
            name: req.customer.name,
            email: req.customer.email,
            contact: req.customer.contact,
        },
        gateway,
        metadata: req.metadata,
    };

    let (payment, kind) = state.billing.payments.create_order(tenant.org_id, params).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            order: OrderInfo {
                order_id: payment.internal_order_id,
                amount: payment.amount_cents,
                currency: payment.currency,
            },
            gateway: kind.as_str().to_string(),
        }),
    ))
}

/// Refund a completed payment, bounded by the original amount
pub async fn refund(
    State(state): State<AppState>,
    tenant: AuthedTenant,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Json<RefundResponse>> {
    let refund = state
        .billing
        .payments
        .refund(tenant.org_id, req.payment_id, req.amount, req.reason.as_deref())
        .await?;

    Ok(Json(RefundResponse {
        payment_id: refund.payment_id,
        refunded: refund.refunded_cents,
        total_refunded: refund.total_refunded_cents,
        status: refund.status,
    }))
}

/// Idempotent read of a payment by its order id
pub async fn order_status(
    State(state): State<AppState>,
    tenant: AuthedTenant,
    Path(order_id): Path<String>,
) -> ApiResult<Json<OrderStatusResponse>> {
    let payment = state
        .billing
        .payments
        .get_by_order_id(tenant.org_id, &order_id)
        .await?;

    let gateway_status = if payment.status == "pending" {
        match state
            .billing
            .payments
            .query_gateway_status(tenant.org_id, &order_id)
            .await
        {
            Ok(status) => serde_json::to_value(status)
                .ok()
                .and_then(|v| v.as_str().map(String::from)),
            Err(e) => {
                // a flaky gateway must not break the read path
                tracing::warn!(
                    org_id = %tenant.org_id,
                    order_id = %order_id,
                    error = %e,
                    "Live gateway status query failed"
                );
                None
            }
        }
    } else {
        None
    };

    Ok(Json(OrderStatusResponse {
        order_id: payment.internal_order_id,
        status: payment.status,
        amount: payment.amount_cents,
        currency: payment.currency,
        refunded: payment.refunded_cents,
        failure_reason: payment.failure_reason,
        gateway_status,
    }))
}
