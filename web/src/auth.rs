//! Bearer-token validation.
//!
//! Token issuance lives outside this system; the ingress only verifies
//! HS256 signatures against `JWT_SECRET` and consumes the claim shape
//! `{user_id, email, role}`.

use crate::error::ApiError;
use crate::state::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use rushtix_core::{Role, UserClaims, UserId};
use serde::Deserialize;
use uuid::Uuid;

/// Raw JWT claims, as issued by the identity provider.
#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Uuid,
    email: String,
    role: Role,
    exp: i64,
}

/// Verifies bearer tokens.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Create a verifier over `JWT_SECRET`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Validate a token and surface its claims.
    ///
    /// # Errors
    ///
    /// Returns 401 `INVALID_TOKEN` for anything that does not verify.
    pub fn verify(&self, token: &str) -> Result<UserClaims, ApiError> {
        let raw = jsonwebtoken::decode::<RawClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| ApiError::invalid_token())?
            .claims;

        let expires_at: DateTime<Utc> = Utc
            .timestamp_opt(raw.exp, 0)
            .single()
            .ok_or_else(ApiError::invalid_token)?;

        Ok(UserClaims {
            user_id: UserId::from_uuid(raw.sub),
            email: raw.email,
            role: raw.role,
            expires_at,
        })
    }
}

/// Extractor requiring a valid bearer token.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub UserClaims);

#[async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(ApiError::missing_token)?;

        let token = header
            .strip_prefix("Bearer ")
            .filter(|t| !t.is_empty())
            .ok_or_else(ApiError::missing_token)?;

        let claims = state.verifier.verify(token)?;
        Ok(Self(claims))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: Uuid,
        email: &'a str,
        role: &'a str,
        exp: i64,
    }

    fn sign(secret: &[u8], claims: &TestClaims<'_>) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_claims() {
        let secret = b"test-secret";
        let user = Uuid::new_v4();
        let token = sign(
            secret,
            &TestClaims {
                sub: user,
                email: "fan@example.com",
                role: "customer",
                exp: Utc::now().timestamp() + 3600,
            },
        );

        let claims = TokenVerifier::new(secret).verify(&token).unwrap();
        assert_eq!(claims.user_id, UserId::from_uuid(user));
        assert_eq!(claims.role, Role::Customer);
        assert_eq!(claims.email, "fan@example.com");
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = b"test-secret";
        let token = sign(
            secret,
            &TestClaims {
                sub: Uuid::new_v4(),
                email: "fan@example.com",
                role: "customer",
                exp: Utc::now().timestamp() - 3600,
            },
        );
        assert!(TokenVerifier::new(secret).verify(&token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = sign(
            b"secret-a",
            &TestClaims {
                sub: Uuid::new_v4(),
                email: "fan@example.com",
                role: "admin",
                exp: Utc::now().timestamp() + 3600,
            },
        );
        assert!(TokenVerifier::new(b"secret-b").verify(&token).is_err());
    }
}
