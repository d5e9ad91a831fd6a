//! Route registration

pub mod gateway_configs;
pub mod payments;
pub mod subscriptions;
pub mod webhooks;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Webhook ingestion: the token in the path is the first security layer
        .route(
            "/api/payment/webhook/{webhook_token}",
            post(webhooks::handle_webhook),
        )
        // Payment operations (tenant-authenticated)
        .route("/api/payment/create-order", post(payments::create_order))
        .route("/api/payment/refund", post(payments::refund))
        .route("/api/payment/status/{order_id}", get(payments::order_status))
        // Gateway credential management
        .route(
            "/api/payment/gateway-configs",
            post(gateway_configs::create_config),
        )
        .route(
            "/api/payment/gateway-configs/{id}",
            delete(gateway_configs::deactivate_config),
        )
        // Platform subscription lifecycle
        .route(
            "/api/platform-subscriptions/start-trial",
            post(subscriptions::start_trial),
        )
        .route(
            "/api/platform-subscriptions/switch-plan",
            post(subscriptions::switch_plan),
        )
        .route(
            "/api/platform-subscriptions/{id}/seats",
            patch(subscriptions::set_seats),
        )
        .route(
            "/api/platform-subscriptions/cancel",
            post(subscriptions::cancel),
        )
        .route(
            "/api/platform-subscriptions/reactivate",
            post(subscriptions::reactivate),
        )
        .route(
            "/api/platform-subscriptions/price-preview",
            post(subscriptions::price_preview),
        )
        .route(
            "/api/platform-subscriptions/events",
            get(subscriptions::recent_events),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
