//! Bearer-token identity for handlers.
//!
//! Tokens are HS256-signed by the identity provider with a shared secret. The `sub` claim
//! carries the numeric user id, either as a JSON number or as a decimal string.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use rasid_core::UserId;
use rasid_extract::TextUnderstanding;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Subject,
    pub exp: i64,
}

/// Verification material built once at startup.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Provider tokens carry an audience we do not pin.
        validation.validate_aud = false;
        Self { key: DecodingKey::from_secret(secret.as_bytes()), validation }
    }

    pub fn verify(&self, token: &str) -> Result<UserId, ApiError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|_| ApiError::Unauthorized("Invalid or expired token"))?;
        match data.claims.sub {
            Subject::Number(id) => Ok(UserId(id)),
            Subject::Text(s) => s
                .parse()
                .map(UserId)
                .map_err(|_| ApiError::Unauthorized("Token subject is not a user id")),
        }
    }
}

/// The verified caller.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

impl<B: TextUnderstanding + 'static> FromRequestParts<AppState<B>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<B>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized("Missing Authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized("Expected: Bearer <token>"))?;
        Ok(AuthUser(state.verifier.verify(token)?))
    }
}

#[cfg(test)]
pub(crate) fn issue_token(secret: &str, sub: Subject) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    let claims = Claims { sub, exp: chrono::Utc::now().timestamp() + 3600 };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .unwrap()
}
