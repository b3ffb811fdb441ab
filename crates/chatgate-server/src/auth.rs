use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chatgate_config::Auth;
use chatgate_contracts::CLIENT_INSTANCE_HEADER;
use chatgate_kernel::client_instance_or_default;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ApiError;
use crate::AppState;

const NO_TOKEN: &str = "Access denied. No token provided.";

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    id: Option<Value>,
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Returns `None` when no secret is configured; requests then fail with a
    /// configuration error rather than being let through.
    pub fn from_config(cfg: &Auth) -> Option<Self> {
        let secret = cfg
            .jwt_secret
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| std::env::var(&cfg.jwt_secret_env).ok())
            .filter(|v| !v.is_empty())?;
        Some(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        })
    }

    pub fn verify(&self, authorization: Option<&str>) -> Result<String, ApiError> {
        let header = authorization.ok_or_else(|| ApiError::Unauthorized(NO_TOKEN.to_string()))?;
        let token = header
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| ApiError::Unauthorized(NO_TOKEN.to_string()))?;

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            debug!(error = %e, "jwt verification failed");
            ApiError::Unauthorized("Invalid token".to_string())
        })?;

        match data.claims.id {
            Some(Value::String(id)) if !id.is_empty() => Ok(id),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(ApiError::Unauthorized(
                "Invalid token: missing user ID".to_string(),
            )),
        }
    }
}

/// Caller identity taken from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let verifier = state
            .auth
            .as_deref()
            .ok_or_else(|| ApiError::Misconfigured("no JWT secret configured".to_string()))?;
        let authorization = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let user_id = verifier.verify(authorization)?;
        Ok(Self { user_id })
    }
}

/// Value of the client instance header, or the unknown-client sentinel.
#[derive(Debug, Clone)]
pub struct ClientInstance(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientInstance {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(CLIENT_INSTANCE_HEADER)
            .and_then(|v| v.to_str().ok());
        Ok(Self(client_instance_or_default(header)))
    }
}
