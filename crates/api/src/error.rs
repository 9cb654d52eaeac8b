//! API errors
//!
//! Every handler returns [`ApiResult`]; domain errors from the billing crate and
//! sqlx convert into [`ApiError`] and are rendered by one `IntoResponse` impl.

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[cfg(feature = "billing")]
use tenantdesk_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("You do not have permission to perform this action")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Too many requests")]
    RateLimit { retry_after_seconds: u64 },

    /// Checkout completed but the subscription webhook has not been processed
    #[error("Subscription is still being set up, try again shortly")]
    SubscriptionNotSynced,

    #[error("Billing is not available")]
    BillingUnavailable,

    #[error("Database error")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) | ApiError::SubscriptionNotSynced => StatusCode::CONFLICT,
            ApiError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BillingUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind for the `error` field
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Validation(_) => "validation_failed",
            ApiError::Conflict(_) => "conflict",
            ApiError::RateLimit { .. } => "rate_limited",
            ApiError::SubscriptionNotSynced => "subscription_not_synced",
            ApiError::BillingUnavailable => "billing_unavailable",
            ApiError::Database(_) => "database_error",
            ApiError::Internal => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Never leak driver messages to clients
        let message = match &self {
            ApiError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": self.kind(),
            "message": message,
        }));

        let mut response = (status, body).into_response();
        if let ApiError::RateLimit {
            retry_after_seconds,
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(feature = "billing")]
impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::NotFound(what) => ApiError::NotFound(what),
            BillingError::SubscriptionNotFound => ApiError::NotFound("Subscription".to_string()),
            BillingError::CustomerNotFound(_) => ApiError::NotFound("Customer".to_string()),
            BillingError::SubscriptionNotSynced => ApiError::SubscriptionNotSynced,
            BillingError::PlanNotSynced(plan_id) => {
                ApiError::Conflict(format!("Plan {} is not synced to Stripe yet", plan_id))
            }
            BillingError::InvalidState(msg) => ApiError::Conflict(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::WebhookEventNotSupported(kind) => {
                ApiError::BadRequest(format!("Unsupported webhook event: {}", kind))
            }
            BillingError::StripeApi(msg) => {
                tracing::error!(error = %msg, "Stripe API call failed");
                ApiError::BillingUnavailable
            }
            BillingError::Config(msg) => {
                tracing::error!(error = %msg, "Billing misconfigured");
                ApiError::BillingUnavailable
            }
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Billing database error");
                ApiError::Internal
            }
            BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Billing internal error");
                ApiError::Internal
            }
        }
    }
}

/// Unwrap an optional row or fail with `NotFound`
pub fn found<T>(value: Option<T>, what: &str) -> ApiResult<T> {
    value.ok_or_else(|| ApiError::NotFound(what.to_string()))
}

/// Fail with a validation error unless `condition` holds
pub fn ensure(condition: bool, message: impl Into<String>) -> ApiResult<()> {
    if condition {
        Ok(())
    } else {
        Err(ApiError::Validation(message.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ApiError::NotFound("Organization".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["message"], "Organization not found");
    }

    #[tokio::test]
    async fn test_rate_limit_sets_retry_after() {
        let response = ApiError::RateLimit {
            retry_after_seconds: 42,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "42");
    }

    #[tokio::test]
    async fn test_database_error_is_opaque() {
        let response = ApiError::Database(sqlx::Error::RowNotFound).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Internal server error");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ApiError::Conflict("dup".into()).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::SubscriptionNotSynced.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::BillingUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_found_and_ensure() {
        assert_eq!(found(Some(3), "Thing").unwrap(), 3);
        assert!(matches!(
            found::<i32>(None, "Thing"),
            Err(ApiError::NotFound(ref w)) if w == "Thing"
        ));
        assert!(ensure(true, "never").is_ok());
        assert!(matches!(ensure(false, "nope"), Err(ApiError::Validation(_))));
    }

    #[cfg(feature = "billing")]
    #[test]
    fn test_billing_error_mapping() {
        assert!(matches!(
            ApiError::from(BillingError::SubscriptionNotSynced),
            ApiError::SubscriptionNotSynced
        ));
        assert!(matches!(
            ApiError::from(BillingError::InvalidInput("x".into())),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::StripeApi("down".into())),
            ApiError::BillingUnavailable
        ));
        assert!(matches!(
            ApiError::from(BillingError::WebhookSignatureInvalid),
            ApiError::BadRequest(_)
        ));
    }
}
