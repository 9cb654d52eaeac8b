//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE, USER_AGENT},
        HeaderMap, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use tenantdesk_shared::{PlatformRole, RateLimiter};

use super::jwt::{JwtError, JwtManager};
use crate::error::ApiError;

/// Cookie set by the front end for browser sessions
const AUTH_COOKIE: &str = "tenantdesk_token";

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    platform_role: String,
}

/// Authenticated user, inserted into request extensions by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub platform_role: PlatformRole,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub pool: PgPool,
    pub rate_limiter: RateLimiter,
    pub rate_limit_per_minute: u32,
}

fn extract_token_from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(AUTH_COOKIE)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(String::from)
            })
        })
}

/// Bearer token from the Authorization header, falling back to the auth cookie.
/// `Err` means a header was present but was not a bearer token.
fn extract_bearer_token(headers: &HeaderMap) -> Result<Option<String>, AuthError> {
    if let Some(header) = headers.get(AUTHORIZATION) {
        let value = header.to_str().map_err(|_| AuthError::InvalidAuthFormat)?;
        return match value.strip_prefix("Bearer ") {
            Some(token) if !token.trim().is_empty() => Ok(Some(token.trim().to_string())),
            _ => Err(AuthError::InvalidAuthFormat),
        };
    }
    Ok(extract_token_from_cookie(headers))
}

/// Extract IP address from request headers (X-Forwarded-For, CF-Connecting-IP or X-Real-IP)
pub fn extract_ip_address(headers: &HeaderMap) -> Option<String> {
    // X-Forwarded-For may carry a chain, the first entry is the client
    if let Some(xff) = headers.get("X-Forwarded-For").and_then(|h| h.to_str().ok()) {
        if let Some(first) = xff.split(',').next().map(str::trim).filter(|s| !s.is_empty()) {
            return Some(first.to_string());
        }
    }
    for name in ["CF-Connecting-IP", "X-Real-IP"] {
        if let Some(ip) = headers.get(name).and_then(|h| h.to_str().ok()) {
            return Some(ip.trim().to_string());
        }
    }
    None
}

fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
}

async fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<UserRow, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_access_token(token)
        .map_err(|e| {
            match &e {
                JwtError::Expired => tracing::debug!("Rejected expired token"),
                other => tracing::debug!(error = %other, "Rejected invalid token"),
            }
            AuthError::InvalidToken
        })?;

    // Deleted users keep valid tokens until expiry; the row is the source of truth
    let user: Option<UserRow> =
        sqlx::query_as("SELECT id, email, platform_role FROM users WHERE id = $1")
            .bind(claims.sub)
            .fetch_optional(&auth_state.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, user_id = %claims.sub, "Failed to load user");
                AuthError::DatabaseError
            })?;

    user.ok_or_else(|| {
        tracing::warn!(user_id = %claims.sub, "Token subject no longer exists");
        AuthError::InvalidToken
    })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let headers = request.headers();
    let ip_address = extract_ip_address(headers);
    let user_agent = extract_user_agent(headers);

    let token = match extract_bearer_token(headers) {
        Ok(Some(token)) => token,
        Ok(None) => {
            tracing::debug!(path = %path, "require_auth: no credentials");
            return AuthError::MissingAuth.into_response();
        }
        Err(err) => return err.into_response(),
    };

    let user = match authenticate_jwt(&auth_state, &token).await {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            return err.into_response();
        }
    };

    let platform_role = user.platform_role.parse().unwrap_or_else(|e| {
        tracing::warn!(user_id = %user.id, error = %e, "Unknown platform role, treating as user");
        PlatformRole::User
    });

    let limit = auth_state
        .rate_limiter
        .check_user(user.id, auth_state.rate_limit_per_minute)
        .await;
    if !limit.allowed {
        tracing::warn!(user_id = %user.id, path = %path, "Rate limit exceeded");
        return ApiError::RateLimit {
            retry_after_seconds: limit.retry_after_seconds.unwrap_or(60),
        }
        .into_response();
    }

    tracing::debug!(path = %path, user_id = %user.id, "require_auth: authenticated");
    request.extensions_mut().insert(AuthUser {
        user_id: user.id,
        email: user.email,
        platform_role,
        ip_address,
        user_agent,
    });
    next.run(request).await
}

/// Per-IP throttle for unauthenticated endpoints
pub async fn rate_limit_by_ip(
    State(auth_state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = extract_ip_address(request.headers()).unwrap_or_else(|| "unknown".to_string());
    let limit = auth_state
        .rate_limiter
        .check_ip(&ip, auth_state.rate_limit_per_minute)
        .await;

    if !limit.allowed {
        tracing::warn!(ip = %ip, path = %request.uri().path(), "IP rate limit exceeded");
        return ApiError::RateLimit {
            retry_after_seconds: limit.retry_after_seconds.unwrap_or(60),
        }
        .into_response();
    }
    next.run(request).await
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Database error")]
    DatabaseError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            AuthError::MissingAuth => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Authentication required",
            ),
            AuthError::InvalidAuthFormat => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid authentication format",
            ),
            AuthError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or expired token",
            ),
            AuthError::DatabaseError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error",
            ),
        };

        let body = Json(json!({
            "error": kind,
            "message": message,
        }));

        (status, body).into_response()
    }
}
