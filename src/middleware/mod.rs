use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;
use crate::models::{Caller, Role};
use crate::AppState;

/// Claims expected in the bearer token issued by the identity service.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError { success: false, message: message.to_string() }),
    )
        .into_response()
}

pub fn verify_token(token: &str, secret: &str) -> Result<Caller, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    let role = data
        .claims
        .role
        .parse::<Role>()
        .map_err(|_| jsonwebtoken::errors::ErrorKind::InvalidToken)?;
    Ok(Caller::new(data.claims.sub, role))
}

// Bearer JWT extractor
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| unauthorized("Missing bearer token"))?;

        verify_token(token.trim(), &state.jwt_secret).map_err(|e| {
            tracing::debug!("rejected bearer token: {}", e);
            unauthorized("Invalid or expired token")
        })
    }
}
