//! JWT access tokens (HS256)
//!
//! Tokens are issued by the identity front end and verified here. Only the
//! subject and email are carried; roles are always read from the database.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

const ISSUER: &str = "tenantdesk";

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Failed to sign token: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    pub fn generate_access_token(&self, user_id: Uuid, email: &str) -> Result<String, JwtError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            iss: ISSUER.to_string(),
            iat: now,
            exp: now + self.expiry_hours * 3600,
            jti: Uuid::new_v4().to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["sub", "exp", "iat", "iss"]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    #[test]
    fn test_issue_and_validate() {
        let manager = JwtManager::new(SECRET, 24);
        let user_id = Uuid::new_v4();
        let token = manager
            .generate_access_token(user_id, "ada@example.com")
            .unwrap();

        let claims = manager.validate_access_token(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "ada@example.com");
        assert_eq!(claims.iss, ISSUER);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtManager::new(SECRET, 24);
        let verifier = JwtManager::new("another-secret-key-of-sufficient-len", 24);
        let token = issuer
            .generate_access_token(Uuid::new_v4(), "ada@example.com")
            .unwrap();

        assert!(matches!(
            verifier.validate_access_token(&token),
            Err(JwtError::Invalid(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Negative lifetime puts exp well past the default leeway
        let manager = JwtManager::new(SECRET, -2);
        let token = manager
            .generate_access_token(Uuid::new_v4(), "ada@example.com")
            .unwrap();

        assert!(matches!(
            manager.validate_access_token(&token),
            Err(JwtError::Expired)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let manager = JwtManager::new(SECRET, 24);
        assert!(manager.validate_access_token("not.a.jwt").is_err());
        assert!(manager.validate_access_token("").is_err());
    }
}
