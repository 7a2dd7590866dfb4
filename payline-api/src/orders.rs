use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use payline_catalog::PaymentType;
use payline_core::repository::OrderFilter;
use payline_core::{Order, OrderStatus, PaymentLog};
use payline_order::CreateOrderInput;
use crate::error::AppError;
use crate::middleware::auth::CustomerClaims;
use crate::page::{PageQuery, PageResponse};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub channel_id: Uuid,
    #[serde(default)]
    pub payment_type: Option<PaymentType>,
    pub amount: i64,
    pub currency: Option<String>,
    pub product_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub order: Order,
    pub provider_ref: String,
    /// Provider payload for the client (checkout URL, client secret)
    pub payment: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub order: Order,
    pub changed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundRequest {
    /// Defaults to the remaining refundable amount
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/{id}", get(get_order))
        .route("/{id}/logs", get(order_logs))
        .route("/{id}/pay", post(pay_order))
        .route("/{id}/verify", post(verify_order))
        .route("/{id}/refund", post(refund_order))
        .route("/{id}/cancel", post(cancel_order))
}

fn forwarded_for(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
}

/// Load an order owned by the caller; other users' orders look absent
async fn owned_order(state: &AppState, claims: &CustomerClaims, order_id: Uuid) -> Result<Order, AppError> {
    let order = state.lifecycle.get(order_id).await?;
    if order.user_id != claims.sub {
        return Err(AppError::NotFoundError(format!("order not found: {}", order_id)));
    }
    Ok(order)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/orders
pub async fn create_order(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let input = CreateOrderInput {
        user_id: claims.sub.clone(),
        channel_id: req.channel_id,
        payment_type: req.payment_type.unwrap_or(PaymentType::OneTime),
        amount: req.amount,
        currency: req.currency,
        product_id: req.product_id,
        subscription_id: None,
        expires_at: req.expires_at,
        metadata: req.metadata,
    };
    let order = state.lifecycle.create(input, &claims.actor(forwarded_for(&headers))).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /v1/orders?cursor=&limit=&status=
pub async fn list_orders(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    Query(query): Query<PageQuery>,
) -> Result<Json<PageResponse<Order>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<OrderStatus>())
        .transpose()
        .map_err(AppError::ValidationError)?;
    let filter = OrderFilter {
        user_id: Some(claims.sub.clone()),
        status,
        ..OrderFilter::default()
    };
    let page = state.lifecycle.list_orders(&filter, query.cursor()?, query.limit()).await?;
    Ok(Json(page.into()))
}

/// GET /v1/orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(owned_order(&state, &claims, order_id).await?))
}

/// GET /v1/orders/:id/logs
pub async fn order_logs(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<PaymentLog>>, AppError> {
    owned_order(&state, &claims, order_id).await?;
    Ok(Json(state.lifecycle.audit_history(order_id).await))
}

/// POST /v1/orders/:id/pay
/// Start the provider-side payment
pub async fn pay_order(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, AppError> {
    owned_order(&state, &claims, order_id).await?;
    let (order, payment) = state
        .lifecycle
        .initiate_provider_payment(order_id, &claims.actor(forwarded_for(&headers)))
        .await?;
    Ok(Json(PaymentResponse {
        order,
        provider_ref: payment.provider_ref,
        payment: payment.payload,
    }))
}

/// POST /v1/orders/:id/verify
/// Client-reported completion, confirmed with the provider
pub async fn verify_order(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<TransitionResponse>, AppError> {
    owned_order(&state, &claims, order_id).await?;
    let outcome = state
        .lifecycle
        .apply_verification(order_id, payload, &claims.actor(forwarded_for(&headers)))
        .await?;
    Ok(Json(TransitionResponse {
        order: outcome.order,
        changed: outcome.changed,
    }))
}

/// POST /v1/orders/:id/refund
pub async fn refund_order(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
    body: Option<Json<RefundRequest>>,
) -> Result<Json<Order>, AppError> {
    owned_order(&state, &claims, order_id).await?;
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let order = state
        .lifecycle
        .refund(order_id, req.amount, req.reason, &claims.actor(forwarded_for(&headers)))
        .await?;
    Ok(Json(order))
}

/// POST /v1/orders/:id/cancel
pub async fn cancel_order(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    owned_order(&state, &claims, order_id).await?;
    let order = state
        .lifecycle
        .cancel(order_id, &claims.actor(forwarded_for(&headers)))
        .await?;
    Ok(Json(order))
}
