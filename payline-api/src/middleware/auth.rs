use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
    http::StatusCode,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use payline_order::Actor;

use crate::state::AppState;

pub const CUSTOMER_ROLE: &str = "CUSTOMER";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CustomerClaims {
    /// Owning user id for orders and subscriptions
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

impl CustomerClaims {
    /// Audit actor, with the client address when a proxy forwarded one
    pub fn actor(&self, forwarded_for: Option<&str>) -> Actor {
        let actor = Actor::user(self.sub.clone());
        match forwarded_for.and_then(|v| v.split(',').next()).map(str::trim) {
            Some(ip) if !ip.is_empty() => actor.with_ip(ip),
            _ => actor,
        }
    }
}

pub async fn customer_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<CustomerClaims>(
        token,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    ).map_err(|_| StatusCode::UNAUTHORIZED)?;

    if token_data.claims.role != CUSTOMER_ROLE {
        return Err(StatusCode::FORBIDDEN);
    }

    req.extensions_mut().insert(token_data.claims);

    Ok(next.run(req).await)
}
