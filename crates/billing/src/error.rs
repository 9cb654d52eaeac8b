//! Billing errors

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Billing configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Plan {0} has not been synced to Stripe")]
    PlanNotSynced(Uuid),

    #[error("Organization has no subscription")]
    SubscriptionNotFound,

    /// Checkout finished but the subscription webhook has not landed yet
    #[error("Subscription has not been synced from Stripe yet")]
    SubscriptionNotSynced,

    #[error("No organization found for Stripe customer {0}")]
    CustomerNotFound(String),

    #[error("Invalid subscription state: {0}")]
    InvalidState(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Unsupported webhook payload: {0}")]
    WebhookEventNotSupported(String),

    #[error("Internal billing error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
