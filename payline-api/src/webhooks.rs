use std::collections::HashMap;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use uuid::Uuid;
use payline_order::WebhookReceipt;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/{channel_id}", post(handle_webhook))
}

/// Header map as the providers see it: lowercase names, UTF-8 values only
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

/// POST /v1/webhooks/:channel_id
/// Provider callbacks. Always acknowledged so providers do not retry; failures
/// are logged and audited by the reconciler.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let Ok(channel_id) = Uuid::parse_str(&channel_id) else {
        tracing::warn!(%channel_id, "Webhook for malformed channel id");
        return Json(json!({ "received": true }));
    };

    match state
        .lifecycle
        .apply_webhook_result(channel_id, &body, &header_map(&headers))
        .await
    {
        Ok(WebhookReceipt::Applied { order_id, changed }) => {
            tracing::info!(%channel_id, %order_id, changed, "Webhook processed");
        }
        Ok(WebhookReceipt::Ignored { event_type }) => {
            tracing::debug!(%channel_id, event_type, "Webhook not tied to an order");
        }
        Err(e) => {
            tracing::warn!(%channel_id, error = %e, "Webhook processing failed");
        }
    }

    Json(json!({ "received": true }))
}
