use axum::{
    extract::State,
    Json,
    routing::post,
    Router,
};
use serde::Serialize;
use jsonwebtoken::{encode, Header, EncodingKey};
use chrono::{Utc, Duration};
use uuid::Uuid;
use crate::{state::AppState, error::AppError, middleware::auth::{CustomerClaims, CUSTOMER_ROLE}};

#[derive(Debug, Serialize)]
struct AuthResponse {
    token: String,
    user_id: String,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/guest", post(login_guest))
}

/// Token for `user_id`, valid for the configured lifetime
pub fn issue_token(state: &AppState, user_id: &str) -> Result<String, AppError> {
    let claims = CustomerClaims {
        sub: user_id.to_string(),
        role: CUSTOMER_ROLE.to_owned(),
        exp: (Utc::now() + Duration::seconds(state.auth.expiration as i64)).timestamp() as usize,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(state.auth.secret.as_bytes()))
        .map_err(|e| AppError::InternalServerError(format!("Token encoding failed: {}", e)))
}

async fn login_guest(State(state): State<AppState>) -> Result<Json<AuthResponse>, AppError> {
    let user_id = format!("guest-{}", Uuid::new_v4());
    let token = issue_token(&state, &user_id)?;
    Ok(Json(AuthResponse { token, user_id }))
}
