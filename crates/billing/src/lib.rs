// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries Stripe error text
#![allow(clippy::field_reassign_with_default)] // Stripe param structs are built field by field
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tenantdesk Billing Module
//!
//! Stripe-backed billing for organizations.
//!
//! ## Features
//!
//! - **Plans**: local plan catalog mirrored to Stripe products and prices
//! - **Subscriptions**: checkout, cancel, resume, pause, plan migration, seats
//! - **Lifecycle**: Stripe status mapping and transition classification
//! - **Webhooks**: verified, idempotent reconciliation of Stripe events
//! - **Events**: per-organization billing timeline
//! - **Invariants**: read-only consistency checks

pub mod client;
pub mod error;
pub mod events;
pub mod invariants;
pub mod lifecycle;
pub mod plans;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventRecord,
    BillingEventType,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{map_stripe_status, SubscriptionSnapshot, Transition};

// Plans
pub use plans::{Plan, PlanInput, PlanService, PlanTier, PlanUpdate, PriceAction};

// Subscriptions
pub use subscriptions::{
    Actor, CheckoutSessionResult, MigrationResult, SubscriptionRecord, SubscriptionService,
    SyncOutcome,
};

// Webhooks
pub use webhooks::{verify_signature, WebhookEventRecord, WebhookHandler, WebhookReplayResult};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub plans: PlanService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub events: BillingEventLogger,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            plans: PlanService::new(stripe.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool.clone()),
            events: BillingEventLogger::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
        }
    }
}
