//! Billing event timeline
//!
//! Append-only log of what happened to an organization's billing, written by
//! the webhook reconciler and by admin actions. Failures to log are reported
//! by callers as warnings and never abort the billing operation itself.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    CheckoutStarted,
    CheckoutCompleted,
    SubscriptionStarted,
    SubscriptionActivated,
    SubscriptionUpdated,
    SubscriptionPaused,
    SubscriptionResumed,
    SubscriptionCanceled,
    CancellationScheduled,
    CancellationReverted,
    PaymentFailed,
    PaymentRecovered,
    PlanMigrated,
    QuantityChanged,
    InvoicePaid,
    InvoicePaymentFailed,
    TrialEnding,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::CheckoutStarted => "checkout_started",
            BillingEventType::CheckoutCompleted => "checkout_completed",
            BillingEventType::SubscriptionStarted => "subscription_started",
            BillingEventType::SubscriptionActivated => "subscription_activated",
            BillingEventType::SubscriptionUpdated => "subscription_updated",
            BillingEventType::SubscriptionPaused => "subscription_paused",
            BillingEventType::SubscriptionResumed => "subscription_resumed",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::CancellationScheduled => "cancellation_scheduled",
            BillingEventType::CancellationReverted => "cancellation_reverted",
            BillingEventType::PaymentFailed => "payment_failed",
            BillingEventType::PaymentRecovered => "payment_recovered",
            BillingEventType::PlanMigrated => "plan_migrated",
            BillingEventType::QuantityChanged => "quantity_changed",
            BillingEventType::InvoicePaid => "invoice_paid",
            BillingEventType::InvoicePaymentFailed => "invoice_payment_failed",
            BillingEventType::TrialEnding => "trial_ending",
        }
    }
}

/// Who caused a billing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Admin,
    Stripe,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Admin => "admin",
            ActorType::Stripe => "stripe",
            ActorType::System => "system",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    organization_id: Uuid,
    event_type: BillingEventType,
    data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(organization_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            organization_id,
            event_type,
            data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn build(self) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            event_type: self.event_type,
            data: self.data,
            stripe_event_id: self.stripe_event_id,
            stripe_subscription_id: self.stripe_subscription_id,
            actor_id: self.actor_id,
            actor_type: self.actor_type,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub event_type: BillingEventType,
    pub data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
}

/// Row as read back for timelines
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingEventRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event = builder.build();
        sqlx::query(
            r#"
            INSERT INTO billing_events (
                id, organization_id, event_type, event_data, stripe_event_id,
                stripe_subscription_id, actor_id, actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.organization_id)
        .bind(event.event_type.as_str())
        .bind(&event.data)
        .bind(&event.stripe_event_id)
        .bind(&event.stripe_subscription_id)
        .bind(event.actor_id)
        .bind(event.actor_type.as_str())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            organization_id = %event.organization_id,
            event_type = event.event_type.as_str(),
            "Billing event logged"
        );

        Ok(event.id)
    }

    /// Most recent events for an organization, newest first
    pub async fn recent(
        &self,
        organization_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEventRecord>> {
        let rows = sqlx::query_as::<_, BillingEventRecord>(
            r#"
            SELECT id, organization_id, event_type, event_data, stripe_event_id,
                   stripe_subscription_id, actor_id, actor_type, created_at
            FROM billing_events
            WHERE organization_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(organization_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_to_system_actor() {
        let org = Uuid::new_v4();
        let event = BillingEventBuilder::new(org, BillingEventType::InvoicePaid).build();
        assert_eq!(event.organization_id, org);
        assert_eq!(event.actor_type, ActorType::System);
        assert!(event.actor_id.is_none());
        assert_eq!(event.data, serde_json::json!({}));
    }

    #[test]
    fn test_builder_sets_stripe_references() {
        let admin = Uuid::new_v4();
        let event = BillingEventBuilder::new(Uuid::new_v4(), BillingEventType::PlanMigrated)
            .data(serde_json::json!({"from": "price_a", "to": "price_b"}))
            .stripe_event("evt_1")
            .stripe_subscription("sub_1")
            .actor(admin, ActorType::Admin)
            .build();

        assert_eq!(event.stripe_event_id.as_deref(), Some("evt_1"));
        assert_eq!(event.stripe_subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(event.actor_id, Some(admin));
        assert_eq!(event.actor_type, ActorType::Admin);
        assert_eq!(event.data["to"], "price_b");
    }

    #[test]
    fn test_event_type_serializes_as_column_value() {
        let json = serde_json::to_value(BillingEventType::CancellationScheduled).unwrap();
        assert_eq!(json, BillingEventType::CancellationScheduled.as_str());
    }
}
