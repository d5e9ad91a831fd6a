//! Gateway configuration routes
//!
//! Tenants register their payment gateway credentials here. The response to
//! a create is the only time the webhook URL (with its embedded token) is
//! returned; the token itself is stored but never listed again.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clinicore_billing::GatewayKind;

use crate::auth::AuthedTenant;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGatewayConfigRequest {
    pub provider: String,
    pub currency: String,
    pub api_key: String,
    pub api_secret: String,
    pub webhook_secret: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGatewayConfigResponse {
    pub id: Uuid,
    pub provider: String,
    pub currency: String,
    pub is_default: bool,
    /// Path the provider should be pointed at for webhooks.
    pub webhook_path: String,
}

pub async fn create_config(
    State(state): State<AppState>,
    tenant: AuthedTenant,
    Json(req): Json<CreateGatewayConfigRequest>,
) -> ApiResult<(StatusCode, Json<CreateGatewayConfigResponse>)> {
    let provider =
        GatewayKind::parse(&req.provider).map_err(|e| ApiError::Validation(e.to_string()))?;

    let config = state
        .billing
        .configs
        .create_config(
            tenant.org_id,
            provider,
            &req.currency.to_uppercase(),
            &req.api_key,
            &req.api_secret,
            &req.webhook_secret,
            req.is_default,
        )
        .await?;

    let webhook_path = format!("/api/payment/webhook/{}", config.webhook_token);

    Ok((
        StatusCode::CREATED,
        Json(CreateGatewayConfigResponse {
            id: config.id,
            provider: config.provider,
            currency: config.currency,
            is_default: config.is_default,
            webhook_path,
        }),
    ))
}

pub async fn deactivate_config(
    State(state): State<AppState>,
    tenant: AuthedTenant,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let removed = state.billing.configs.deactivate(tenant.org_id, id).await?;
    if !removed {
        // unknown id and another tenant's id are indistinguishable
        return Err(ApiError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}
