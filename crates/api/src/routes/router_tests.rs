//! Router tests
//!
//! Run against a lazy pool that never connects, so they cover routing, the
//! auth layer and error rendering without a database.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;
    use uuid::Uuid;

    use tenantdesk_shared::MemoryCache;

    use crate::{config::Config, routes::create_router, state::AppState};

    const SECRET: &str = "router-test-secret-that-is-long-enough";

    fn test_config() -> Config {
        Config {
            database_url: "postgres://tenantdesk@127.0.0.1:1/tenantdesk".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            jwt_secret: SECRET.to_string(),
            redis_url: None,
            permission_cache_ttl: Duration::from_secs(600),
            enable_billing: false,
            allowed_origins: vec![],
            rate_limit_per_minute: 2,
            run_migrations: false,
        }
    }

    fn test_state() -> AppState {
        let config = test_config();
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy(&config.database_url)
            .unwrap();
        AppState::new(pool, config, Arc::new(MemoryCache::new()))
    }

    fn app() -> Router {
        create_router(test_state())
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let response = app()
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["billing"], false);
        assert_eq!(body["permission_cache"], "memory");
    }

    #[tokio::test]
    async fn test_protected_route_requires_token() {
        let response = app()
            .oneshot(
                Request::get("/api/v1/organizations")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn test_wrong_scheme_rejected() {
        let response = app()
            .oneshot(
                Request::get("/api/v1/permissions")
                    .header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_forged_token_rejected() {
        let forged = crate::auth::JwtManager::new("some-other-secret-entirely-32bytes", 1)
            .generate_access_token(Uuid::new_v4(), "mallory@example.com")
            .unwrap();

        let response = app()
            .oneshot(
                Request::get(format!("/api/v1/organizations/{}", Uuid::new_v4()))
                    .header(header::AUTHORIZATION, format!("Bearer {}", forged))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_token_with_database_down_is_500() {
        let token = crate::auth::JwtManager::new(SECRET, 1)
            .generate_access_token(Uuid::new_v4(), "ada@example.com")
            .unwrap();

        let response = app()
            .oneshot(
                Request::get("/api/v1/organizations")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Internal server error");
    }

    #[cfg(feature = "billing")]
    #[tokio::test]
    async fn test_webhook_without_billing_is_503() {
        let response = app()
            .oneshot(
                Request::post("/api/v1/webhooks/stripe")
                    .header("Stripe-Signature", "t=1,v1=00")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"], "billing_unavailable");
    }

    #[cfg(feature = "billing")]
    #[tokio::test]
    async fn test_webhook_is_rate_limited_per_ip() {
        // Limit is 2 per minute in the test config
        let app = app();
        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/api/v1/webhooks/stripe")
                        .header("X-Forwarded-For", "198.51.100.9")
                        .body(Body::from("{}"))
                        .unwrap(),
                )
                .await
                .unwrap();
            statuses.push(response.status());
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                assert!(response.headers().contains_key(header::RETRY_AFTER));
            }
        }

        assert_eq!(statuses[2], StatusCode::TOO_MANY_REQUESTS);
    }

    #[cfg(feature = "billing")]
    #[tokio::test]
    async fn test_failed_webhook_listing_is_mounted_behind_auth() {
        let response = app()
            .oneshot(
                Request::get("/api/v1/admin/webhooks/failed?limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // Unmatched paths skip the auth layer and 404
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = app()
            .oneshot(Request::get("/api/v1/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
