use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use payline_core::{Order, Subscription};
use payline_order::CreateSubscriptionInput;
use crate::error::AppError;
use crate::middleware::auth::CustomerClaims;
use crate::page::{PageQuery, PageResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub product_id: Uuid,
    pub channel_id: Uuid,
    /// Overrides the product's trial length; `0` bills immediately
    pub trial_days: Option<u32>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Subscription,
    /// First-period order, absent during a trial
    pub order: Option<Order>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub immediate: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_subscription).get(list_subscriptions))
        .route("/{id}", get(get_subscription).patch(update_subscription))
        .route("/{id}/cancel", post(cancel_subscription))
}

async fn owned_subscription(
    state: &AppState,
    claims: &CustomerClaims,
    subscription_id: Uuid,
) -> Result<Subscription, AppError> {
    let subscription = state.subscriptions.get(subscription_id).await?;
    if subscription.user_id != claims.sub {
        return Err(AppError::NotFoundError(format!("subscription not found: {}", subscription_id)));
    }
    Ok(subscription)
}

/// POST /v1/subscriptions
pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    headers: HeaderMap,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<SubscriptionResponse>), AppError> {
    let input = CreateSubscriptionInput {
        user_id: claims.sub.clone(),
        product_id: req.product_id,
        channel_id: req.channel_id,
        trial_days: req.trial_days,
        metadata: req.metadata,
    };
    let forwarded = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let created = state.subscriptions.create(input, &claims.actor(forwarded)).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubscriptionResponse {
            subscription: created.subscription,
            order: created.order,
        }),
    ))
}

/// GET /v1/subscriptions?cursor=&limit=
pub async fn list_subscriptions(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    Query(query): Query<PageQuery>,
) -> Result<Json<PageResponse<Subscription>>, AppError> {
    let page = state
        .subscriptions
        .list(&claims.sub, query.cursor()?, query.limit())
        .await?;
    Ok(Json(page.into()))
}

/// GET /v1/subscriptions/:id
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    Ok(Json(owned_subscription(&state, &claims, subscription_id).await?))
}

/// PATCH /v1/subscriptions/:id
/// Merge the body into the subscription's metadata
pub async fn update_subscription(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    Path(subscription_id): Path<Uuid>,
    Json(updates): Json<serde_json::Value>,
) -> Result<Json<Subscription>, AppError> {
    owned_subscription(&state, &claims, subscription_id).await?;
    Ok(Json(state.subscriptions.update(subscription_id, updates).await?))
}

/// POST /v1/subscriptions/:id/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    headers: HeaderMap,
    Path(subscription_id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<Subscription>, AppError> {
    owned_subscription(&state, &claims, subscription_id).await?;
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let forwarded = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let subscription = state
        .subscriptions
        .cancel(subscription_id, req.immediate, &claims.actor(forwarded))
        .await?;
    Ok(Json(subscription))
}
