//! Platform subscription routes

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clinicore_billing::{compute_price, normalize_seat_count, BillingCycle, Proration};

use crate::auth::AuthedTenant;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPlanRequest {
    pub plan_slug: String,
    pub billing_cycle: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPlanResponse {
    pub from_plan: String,
    pub to_plan: String,
    pub billing_cycle: String,
    pub new_mrr: f64,
    pub change: String,
    pub proration: ProrationInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProrationInfo {
    pub unused_credit: f64,
    pub new_charge: f64,
    /// Positive: charged now. Negative: credit issued.
    pub delta: f64,
    pub days_remaining: i64,
}

impl From<Proration> for ProrationInfo {
    fn from(p: Proration) -> Self {
        Self {
            unused_credit: p.unused_credit,
            new_charge: p.new_charge,
            delta: p.delta,
            days_remaining: p.days_remaining,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSeatsRequest {
    pub seat_count: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSeatsResponse {
    pub seat_count: i32,
    pub new_mrr: f64,
    pub proration: ProrationInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusResponse {
    pub id: Uuid,
    pub plan_slug: String,
    pub billing_cycle: String,
    pub status: String,
    pub seat_count: i32,
    pub mrr: f64,
}

/// Switch plan and/or billing cycle, effective immediately
pub async fn switch_plan(
    State(state): State<AppState>,
    tenant: AuthedTenant,
    Json(req): Json<SwitchPlanRequest>,
) -> ApiResult<Json<SwitchPlanResponse>> {
    let cycle = BillingCycle::parse(&req.billing_cycle)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let change = state
        .billing
        .subscriptions
        .switch_plan(tenant.org_id, &req.plan_slug, cycle)
        .await?;

    Ok(Json(SwitchPlanResponse {
        from_plan: change.from_plan,
        to_plan: change.to_plan,
        billing_cycle: change.to_cycle,
        new_mrr: change.new_mrr,
        change: change.event_type,
        proration: change.proration.into(),
    }))
}

/// Change the seat count on a specific subscription. The id must belong to
/// the calling tenant; any other id answers 404.
pub async fn set_seats(
    State(state): State<AppState>,
    tenant: AuthedTenant,
    Path(id): Path<Uuid>,
    Json(req): Json<SetSeatsRequest>,
) -> ApiResult<Json<SetSeatsResponse>> {
    // scoped ownership check before any mutation
    state
        .billing
        .subscriptions
        .get_scoped(tenant.org_id, id)
        .await?;

    let change = state
        .billing
        .subscriptions
        .set_seat_count(tenant.org_id, req.seat_count)
        .await?;

    Ok(Json(SetSeatsResponse {
        seat_count: change.new_seat_count,
        new_mrr: change.new_mrr,
        proration: change.proration.into(),
    }))
}

/// User-initiated cancellation
pub async fn cancel(
    State(state): State<AppState>,
    tenant: AuthedTenant,
) -> ApiResult<Json<SubscriptionStatusResponse>> {
    let sub = state.billing.subscriptions.cancel(tenant.org_id).await?;
    Ok(Json(status_of(sub)))
}

/// Explicit reactivation of a cancelled subscription
pub async fn reactivate(
    State(state): State<AppState>,
    tenant: AuthedTenant,
) -> ApiResult<Json<SubscriptionStatusResponse>> {
    let sub = state.billing.subscriptions.reactivate(tenant.org_id).await?;
    Ok(Json(status_of(sub)))
}

fn status_of(sub: clinicore_billing::PlatformSubscription) -> SubscriptionStatusResponse {
    SubscriptionStatusResponse {
        id: sub.id,
        plan_slug: sub.plan_slug,
        billing_cycle: sub.billing_cycle,
        status: sub.status,
        seat_count: sub.seat_count,
        mrr: sub.mrr,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTrialRequest {
    pub plan_slug: String,
    pub billing_cycle: String,
    #[serde(default = "default_seats")]
    pub seat_count: f64,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default = "default_trial_days")]
    pub trial_days: i64,
}

fn default_seats() -> f64 {
    1.0
}

fn default_trial_days() -> i64 {
    14
}

/// Start a trial subscription for a tenant without one
pub async fn start_trial(
    State(state): State<AppState>,
    tenant: AuthedTenant,
    Json(req): Json<StartTrialRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<SubscriptionStatusResponse>)> {
    let cycle = BillingCycle::parse(&req.billing_cycle)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let sub = state
        .billing
        .subscriptions
        .start_trial(
            tenant.org_id,
            &req.plan_slug,
            cycle,
            req.seat_count,
            req.region_code.as_deref(),
            req.trial_days,
        )
        .await?;

    Ok((axum::http::StatusCode::CREATED, Json(status_of(sub))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePreviewRequest {
    pub plan_slug: String,
    pub billing_cycle: String,
    pub seat_count: f64,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePreviewResponse {
    pub plan_slug: String,
    pub billing_cycle: String,
    pub seat_count: u32,
    pub currency: String,
    pub monthly_total: f64,
    pub coupon_applied: bool,
}

/// Preview the monthly price for a plan, cycle, seat count, region, and
/// optional coupon, without touching the subscription
pub async fn price_preview(
    State(state): State<AppState>,
    _tenant: AuthedTenant,
    Json(req): Json<PricePreviewRequest>,
) -> ApiResult<Json<PricePreviewResponse>> {
    let cycle = BillingCycle::parse(&req.billing_cycle)
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    let seats = normalize_seat_count(req.seat_count)?;

    let plan = state.billing.catalog.get_plan(&req.plan_slug).await?;
    let region = match req.region_code.as_deref() {
        Some(code) => state.billing.catalog.get_region(code).await?,
        None => None,
    };
    let coupon = match req.coupon_code.as_deref() {
        Some(code) => state.billing.catalog.get_coupon(code).await?,
        None => None,
    };

    let base = plan.base_price_for_cycle(cycle);
    let without_coupon = compute_price(base, region.as_ref(), seats, cycle, None)?;
    let monthly_total = compute_price(base, region.as_ref(), seats, cycle, coupon.as_ref())?;

    let currency = region
        .as_ref()
        .map(|r| r.currency.clone())
        .unwrap_or_else(|| "USD".to_string());

    Ok(Json(PricePreviewResponse {
        plan_slug: plan.slug,
        billing_cycle: cycle.as_str().to_string(),
        seat_count: seats,
        currency,
        monthly_total,
        coupon_applied: monthly_total != without_coupon,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEventInfo {
    pub event_type: String,
    pub data: serde_json::Value,
    pub created_at: String,
}

/// Recent lifecycle events for the tenant, newest first
pub async fn recent_events(
    State(state): State<AppState>,
    tenant: AuthedTenant,
) -> ApiResult<Json<Vec<SubscriptionEventInfo>>> {
    let events = state.billing.events.recent_for_org(tenant.org_id, 50).await?;

    Ok(Json(
        events
            .into_iter()
            .map(|e| SubscriptionEventInfo {
                event_type: e.event_type,
                data: e.data,
                created_at: e.created_at.to_string(),
            })
            .collect(),
    ))
}
