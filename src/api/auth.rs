//! Bearer-token authentication
//!
//! Tokens have the shape `<user_id>.<signature>` where the signature is a
//! SHA-256 over the token secret and the user id. Token issuance happens
//! out of band; this module only verifies and resolves the calling user.
//! `mint_token` exists for operational tooling and tests.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::database::UserRepository;
use crate::models::User;

use super::AppState;

fn signature(secret: &str, user_id: &Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b".");
    hasher.update(user_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Produce a token for a user id.
pub fn mint_token(secret: &str, user_id: &Uuid) -> String {
    format!("{user_id}.{}", signature(secret, user_id))
}

/// Verify a token and extract the user id.
pub fn verify_token(secret: &str, token: &str) -> Option<Uuid> {
    let (id_part, sig_part) = token.split_once('.')?;
    let user_id = Uuid::parse_str(id_part).ok()?;
    if signature(secret, &user_id) == sig_part {
        Some(user_id)
    } else {
        None
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"kind": "Unauthenticated", "message": message})),
    )
        .into_response()
}

/// Extractor for the authenticated caller; resolves the user record so
/// handlers get the role along with the id.
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| unauthorized("missing Authorization header"))?;

        let user_id = verify_token(&state.config.token_secret, token)
            .ok_or_else(|| unauthorized("invalid token"))?;

        let user = UserRepository::get(&state.pool, user_id)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "user lookup failed during auth");
                unauthorized("authentication failed")
            })?
            .ok_or_else(|| unauthorized("unknown user"))?;

        Ok(AuthUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let user_id = Uuid::from_u128(99);
        let token = mint_token("secret", &user_id);
        assert_eq!(verify_token("secret", &token), Some(user_id));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let user_id = Uuid::from_u128(99);
        let token = mint_token("secret", &user_id);
        assert_eq!(verify_token("other-secret", &token), None);
    }

    #[test]
    fn test_tampered_token_rejected() {
        let user_id = Uuid::from_u128(99);
        let other = Uuid::from_u128(100);
        let token = mint_token("secret", &user_id);
        let sig = token.split_once('.').unwrap().1.to_string();
        assert_eq!(verify_token("secret", &format!("{other}.{sig}")), None);
        assert_eq!(verify_token("secret", "garbage"), None);
    }
}
