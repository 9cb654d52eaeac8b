//! Edge Case Tests for Authentication
//!
//! Boundary conditions in JWT validation and request header parsing.

#[cfg(test)]
mod jwt_tests {
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::auth::jwt::{JwtError, JwtManager};

    const SECRET: &str = "edge-case-secret-with-enough-bytes-1234";

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn sign(claims: serde_json::Value, alg: Algorithm) -> String {
        encode(
            &Header::new(alg),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    // =========================================================================
    // Token from another issuer is rejected even with the right key
    // =========================================================================
    #[test]
    fn test_foreign_issuer_rejected() {
        let token = sign(
            json!({
                "sub": Uuid::new_v4(),
                "email": "a@example.com",
                "iss": "someone-else",
                "iat": now(),
                "exp": now() + 3600,
                "jti": "x",
            }),
            Algorithm::HS256,
        );

        let result = JwtManager::new(SECRET, 1).validate_access_token(&token);
        assert!(matches!(result, Err(JwtError::Invalid(_))));
    }

    // =========================================================================
    // Only HS256 is accepted
    // =========================================================================
    #[test]
    fn test_other_hmac_algorithm_rejected() {
        let token = sign(
            json!({
                "sub": Uuid::new_v4(),
                "email": "a@example.com",
                "iss": "tenantdesk",
                "iat": now(),
                "exp": now() + 3600,
                "jti": "x",
            }),
            Algorithm::HS512,
        );

        assert!(JwtManager::new(SECRET, 1)
            .validate_access_token(&token)
            .is_err());
    }

    // =========================================================================
    // Missing subject is rejected
    // =========================================================================
    #[test]
    fn test_missing_subject_rejected() {
        let token = sign(
            json!({
                "email": "a@example.com",
                "iss": "tenantdesk",
                "iat": now(),
                "exp": now() + 3600,
                "jti": "x",
            }),
            Algorithm::HS256,
        );

        assert!(JwtManager::new(SECRET, 1)
            .validate_access_token(&token)
            .is_err());
    }

    // =========================================================================
    // Subject that is not a UUID is rejected
    // =========================================================================
    #[test]
    fn test_non_uuid_subject_rejected() {
        let token = sign(
            json!({
                "sub": "admin",
                "email": "a@example.com",
                "iss": "tenantdesk",
                "iat": now(),
                "exp": now() + 3600,
                "jti": "x",
            }),
            Algorithm::HS256,
        );

        assert!(matches!(
            JwtManager::new(SECRET, 1).validate_access_token(&token),
            Err(JwtError::Invalid(_))
        ));
    }

    // =========================================================================
    // Expiry within the default 60s leeway still validates
    // =========================================================================
    #[test]
    fn test_expiry_inside_leeway_accepted() {
        let user_id = Uuid::new_v4();
        let token = sign(
            json!({
                "sub": user_id,
                "email": "a@example.com",
                "iss": "tenantdesk",
                "iat": now() - 3600,
                "exp": now() - 10,
                "jti": "x",
            }),
            Algorithm::HS256,
        );

        let claims = JwtManager::new(SECRET, 1)
            .validate_access_token(&token)
            .unwrap();
        assert_eq!(claims.sub, user_id);
    }

    // =========================================================================
    // Expiry well past the leeway maps to Expired, not Invalid
    // =========================================================================
    #[test]
    fn test_expiry_past_leeway_is_expired() {
        let token = sign(
            json!({
                "sub": Uuid::new_v4(),
                "email": "a@example.com",
                "iss": "tenantdesk",
                "iat": now() - 7200,
                "exp": now() - 600,
                "jti": "x",
            }),
            Algorithm::HS256,
        );

        assert!(matches!(
            JwtManager::new(SECRET, 1).validate_access_token(&token),
            Err(JwtError::Expired)
        ));
    }

    // =========================================================================
    // Every issued token gets its own jti
    // =========================================================================
    #[test]
    fn test_issued_tokens_are_unique() {
        let manager = JwtManager::new(SECRET, 1);
        let user_id = Uuid::new_v4();
        let a = manager.generate_access_token(user_id, "a@example.com").unwrap();
        let b = manager.generate_access_token(user_id, "a@example.com").unwrap();
        assert_ne!(a, b);

        let ca = manager.validate_access_token(&a).unwrap();
        let cb = manager.validate_access_token(&b).unwrap();
        assert_ne!(ca.jti, cb.jti);
    }
}

#[cfg(test)]
mod header_tests {
    use axum::http::{HeaderMap, HeaderValue};

    use crate::auth::middleware::extract_ip_address;

    // =========================================================================
    // X-Forwarded-For chain: first hop is the client
    // =========================================================================
    #[test]
    fn test_forwarded_chain_uses_first_hop() {
        let mut h = HeaderMap::new();
        h.insert(
            "X-Forwarded-For",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1, 10.0.0.2"),
        );
        assert_eq!(extract_ip_address(&h).as_deref(), Some("203.0.113.7"));
    }

    // =========================================================================
    // Empty X-Forwarded-For falls through to the next header
    // =========================================================================
    #[test]
    fn test_empty_forwarded_falls_through() {
        let mut h = HeaderMap::new();
        h.insert("X-Forwarded-For", HeaderValue::from_static(""));
        h.insert("X-Real-IP", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(extract_ip_address(&h).as_deref(), Some("198.51.100.4"));
    }

    // =========================================================================
    // No proxy headers at all
    // =========================================================================
    #[test]
    fn test_no_headers_gives_none() {
        assert_eq!(extract_ip_address(&HeaderMap::new()), None);
    }
}
