//! JWT Token Verification
//!
//! HS256 tokens whose `sub` claim is the numeric user id.

use async_trait::async_trait;
use jsonwebtoken::{decode, errors::ErrorKind, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::domain::{AuthVerifier, VerifiedIdentity};
use crate::shared::error::AppError;

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at time (Unix timestamp)
    #[serde(default)]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Verifies tokens signed with the shared secret
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AppError> {
        let token_data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AppError::Authentication("Token expired".into()),
                _ => AppError::Authentication("Invalid token".into()),
            }
        })?;

        let user_id = token_data
            .claims
            .sub
            .parse::<i64>()
            .map_err(|_| AppError::Authentication("Invalid user ID in token".into()))?;

        Ok(VerifiedIdentity {
            user_id,
            email: token_data.claims.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-key-for-jwt-that-is-long-enough";

    fn token(sub: &str, expires_in: Duration) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: sub.to_string(),
            exp: (now + expires_in).timestamp(),
            iat: now.timestamp(),
            email: Some("alice@example.com".into()),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token() {
        let verifier = JwtVerifier::new(SECRET);
        let identity = verifier.verify(&token("42", Duration::hours(1))).await.unwrap();
        assert_eq!(identity.user_id, 42);
        assert_eq!(identity.email.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let verifier = JwtVerifier::new(SECRET);
        let err = verifier
            .verify(&token("42", Duration::hours(-2)))
            .await
            .unwrap_err();
        assert_eq!(err.client_message(), "Token expired");
        assert_eq!(err.code(), "AUTH_FAILED");
    }

    #[tokio::test]
    async fn test_wrong_secret_and_bad_subject() {
        let verifier = JwtVerifier::new("another-secret-key-that-is-also-long-enough");
        assert!(verifier.verify(&token("42", Duration::hours(1))).await.is_err());

        let verifier = JwtVerifier::new(SECRET);
        assert!(verifier
            .verify(&token("not-a-number", Duration::hours(1)))
            .await
            .is_err());
        assert!(verifier.verify("garbage").await.is_err());
    }
}
