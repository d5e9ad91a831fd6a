//! Webhook ingestion endpoint
//!
//! Thin shell over the billing pipeline: the handler passes the token, the
//! raw headers, and the untouched body bytes straight through. The body must
//! stay raw because provider signatures are computed over the exact bytes on
//! the wire; any re-serialization would break verification.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;

use crate::state::AppState;

pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(webhook_token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (axum::http::StatusCode, &'static str) {
    state
        .billing
        .webhooks
        .handle(&webhook_token, &headers, &body)
        .await
}
