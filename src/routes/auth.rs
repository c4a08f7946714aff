use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, Validation};

use crate::app_state::AppState;
use crate::models::api::Claims;
use crate::routes::error::ApiError;

/// Authenticated caller. Holds the ledger user id from the token's `sub`.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;

        let data = decode::<Claims>(token, &state.jwt_key, &Validation::new(Algorithm::HS256))
            .map_err(|e| ApiError::Unauthorized(e.to_string()))?;

        if data.claims.sub.is_empty() {
            return Err(ApiError::Unauthorized("token has no subject".into()));
        }
        Ok(AuthUser(data.claims.sub))
    }
}
