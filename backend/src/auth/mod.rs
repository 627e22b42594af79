//! Verify-only JWT authentication.
//!
//! Token issuance lives in the identity service; this backend only validates
//! bearer tokens and loads the active user row. The tenant a request operates
//! on is always the authenticated user's organization, never a payload field.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;
use crate::AppState;
use lattice_shared::User;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid, // Subject (user ID)
    pub org: Uuid, // Organization the token was issued for
    pub email: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

pub fn create_jwt(user: &User) -> Result<String, jsonwebtoken::errors::Error> {
    let secret = get_jwt_secret();
    let now = Utc::now();

    let claims = Claims {
        sub: user.id,
        org: user.organization_id,
        email: user.email.clone(),
        role: user.role.clone(),
        exp: (now + chrono::Duration::hours(24)).timestamp(),
        iat: now.timestamp(),
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref()))
}

pub fn verify_jwt(token: &str) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
    let secret = get_jwt_secret();
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )
}

fn get_jwt_secret() -> String {
    env::var("JWT_SECRET").unwrap_or_else(|_| {
        tracing::warn!("JWT_SECRET not set, using default (insecure for production)");
        "your-secret-key".to_string()
    })
}

/// Authenticated user extractor
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl AuthUser {
    /// Configuration writes are restricted to tenant administrators.
    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.0.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden("Administrator role required".to_string()))
        }
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthorized("Missing authorization header".to_string()).into_response()
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Unauthorized("Invalid authorization format".to_string()).into_response()
        })?;

        let token_data = verify_jwt(token).map_err(|e| AppError::from(e).into_response())?;

        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE id = $1 AND is_active = true",
        )
        .bind(token_data.claims.sub)
        .fetch_optional(&state.db_pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()).into_response())?
        .ok_or_else(|| {
            AppError::Unauthorized("User not found or inactive".to_string()).into_response()
        })?;

        Ok(AuthUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            email: "agent@example.com".to_string(),
            first_name: "Agent".to_string(),
            last_name: "One".to_string(),
            role: "agent".to_string(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_jwt_round_trip() {
        let user = sample_user();
        let token = create_jwt(&user).expect("token");
        let decoded = verify_jwt(&token).expect("decode");

        assert_eq!(decoded.claims.sub, user.id);
        assert_eq!(decoded.claims.org, user.organization_id);
        assert_eq!(decoded.claims.role, "agent");
    }

    #[test]
    fn test_require_admin() {
        let mut user = sample_user();
        assert!(AuthUser(user.clone()).require_admin().is_err());

        user.role = "admin".to_string();
        assert!(AuthUser(user).require_admin().is_ok());
    }
}
