use axum::{
    routing::get,
    Json, Router,
    http::Method,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod error;
pub mod middleware;
pub mod orders;
pub mod page;
pub mod state;
pub mod subscriptions;
pub mod webhooks;
pub mod worker;

pub use state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    let customer = axum::middleware::from_fn_with_state(state.clone(), middleware::customer_auth_middleware);

    Router::new()
        .route("/health", get(health))
        .nest("/v1/auth", auth::routes())
        .nest("/v1/orders", orders::routes().route_layer(customer.clone()))
        .nest("/v1/subscriptions", subscriptions::routes().route_layer(customer))
        .nest("/v1/webhooks", webhooks::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
