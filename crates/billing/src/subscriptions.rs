//! Subscription management
//!
//! Stripe is the source of truth. Every method that changes a subscription
//! calls Stripe first and then stores what Stripe returned through
//! [`SubscriptionService::sync_from_stripe`], the only code path that writes
//! the `status` column.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::PgPool;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    CancelSubscription, CreateCustomer, Customer, Subscription, SubscriptionId, UpdateSubscription,
    UpdateSubscriptionItems,
};
use time::OffsetDateTime;
use uuid::Uuid;

use tenantdesk_shared::{PricingModel, SubscriptionStatus};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::lifecycle::{
    on_grace_period, price_change_required, LifecycleFields, PriorState, SubscriptionSnapshot,
    Transition,
};
use crate::plans::Plan;

/// Local mirror of a Stripe subscription
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_price_id: Option<String>,
    pub stripe_item_id: Option<String>,
    pub status: String,
    pub quantity: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paused_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_synced_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SubscriptionRecord {
    pub fn status(&self) -> BillingResult<SubscriptionStatus> {
        self.status
            .parse()
            .map_err(|e| BillingError::Internal(format!("{}", e)))
    }

    pub fn on_grace_period(&self, now: OffsetDateTime) -> bool {
        self.status()
            .map(|status| on_grace_period(status, self.cancel_at_period_end, self.ends_at, now))
            .unwrap_or(false)
    }

    fn stripe_id(&self) -> BillingResult<SubscriptionId> {
        self.stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, organization_id, plan_id, stripe_subscription_id, \
     stripe_customer_id, stripe_price_id, stripe_item_id, status, quantity, trial_ends_at, \
     current_period_start, current_period_end, cancel_at_period_end, canceled_at, ends_at, \
     paused_at, last_synced_at, created_at";

/// Result of writing a Stripe subscription to the database
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub subscription: SubscriptionRecord,
    pub transition: Transition,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSessionResult {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    /// False when the subscription was already on the plan's price
    pub changed: bool,
    pub subscription: SubscriptionRecord,
}

/// Who asked for a subscription change
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub id: Uuid,
    pub kind: ActorType,
}

impl Actor {
    pub fn user(id: Uuid) -> Self {
        Self {
            id,
            kind: ActorType::User,
        }
    }

    pub fn admin(id: Uuid) -> Self {
        Self {
            id,
            kind: ActorType::Admin,
        }
    }
}

// ============ STRIPE FORMS ============

#[derive(Debug, Serialize)]
struct CheckoutLineItemForm<'a> {
    price: &'a str,
    quantity: u64,
}

#[derive(Debug, Serialize)]
struct CheckoutSubscriptionDataForm {
    #[serde(skip_serializing_if = "Option::is_none")]
    trial_period_days: Option<i32>,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct CheckoutSessionForm<'a> {
    mode: &'static str,
    customer: &'a str,
    client_reference_id: String,
    success_url: &'a str,
    cancel_url: &'a str,
    line_items: Vec<CheckoutLineItemForm<'a>>,
    subscription_data: CheckoutSubscriptionDataForm,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct PauseCollectionForm {
    behavior: &'static str,
}

#[derive(Debug, Serialize)]
struct PauseSubscriptionForm {
    pause_collection: PauseCollectionForm,
}

/// Stripe clears `pause_collection` when it is posted empty
#[derive(Debug, Serialize)]
struct ResumeCollectionForm {
    pause_collection: &'static str,
}

fn checkout_metadata(org_id: Uuid, plan_id: Uuid) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("org_id".to_string(), org_id.to_string());
    metadata.insert("plan_id".to_string(), plan_id.to_string());
    metadata
}

/// Subscription service
#[derive(Clone)]
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            event_logger,
        }
    }

    // ============ READS ============

    /// The organization's current subscription, preferring an open one
    pub async fn current(&self, org_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE organization_id = $1
            ORDER BY (status <> 'canceled') DESC, created_at DESC
            LIMIT 1
            "#
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = record {
            return Ok(record);
        }

        // Checkout finished in Stripe but the subscription webhook is still in flight
        let in_flight: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT stripe_session_id
            FROM pending_checkouts
            WHERE organization_id = $1
              AND completed_at IS NOT NULL
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        match in_flight {
            Some(_) => Err(BillingError::SubscriptionNotSynced),
            None => Err(BillingError::SubscriptionNotFound),
        }
    }

    pub async fn find_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1"
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Open subscriptions least recently synced, for drift reconciliation
    pub async fn stale_open_subscriptions(&self, limit: i64) -> BillingResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT stripe_subscription_id
            FROM subscriptions
            WHERE status <> 'canceled'
            ORDER BY last_synced_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn fetch_from_stripe(&self, stripe_subscription_id: &str) -> BillingResult<Subscription> {
        let sub_id = stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;
        Ok(Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?)
    }

    async fn open_subscription(&self, org_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record = self.current(org_id).await?;
        if record.status()? == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidState(
                "Subscription is canceled".to_string(),
            ));
        }
        Ok(record)
    }

    // ============ SYNC ============

    /// Upsert the local row from a Stripe subscription object
    pub async fn sync_from_stripe(&self, subscription: &Subscription) -> BillingResult<SyncOutcome> {
        let snapshot = SubscriptionSnapshot::from_stripe(subscription);

        let prior_row: Option<(Uuid, String, Option<OffsetDateTime>, Option<OffsetDateTime>)> =
            sqlx::query_as(
                r#"
                SELECT organization_id, status, canceled_at, paused_at
                FROM subscriptions
                WHERE stripe_subscription_id = $1
                "#,
            )
            .bind(&snapshot.stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        let org_id = match (snapshot.organization_id, &prior_row) {
            (Some(org_id), _) => org_id,
            (None, Some((org_id, ..))) => *org_id,
            (None, None) => self.org_for_customer(&snapshot.stripe_customer_id).await?,
        };

        let prior = match &prior_row {
            Some((_, status, canceled_at, paused_at)) => PriorState {
                status: status.parse().ok(),
                canceled_at: *canceled_at,
                paused_at: *paused_at,
            },
            None => PriorState::default(),
        };

        let fields = LifecycleFields::derive(&snapshot, prior, OffsetDateTime::now_utc());
        let plan_id = self.plan_for_snapshot(&snapshot).await?;

        let record: SubscriptionRecord = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                id, organization_id, plan_id, stripe_subscription_id, stripe_customer_id,
                stripe_price_id, stripe_item_id, status, quantity, trial_ends_at,
                current_period_start, current_period_end, cancel_at_period_end,
                canceled_at, ends_at, paused_at, last_synced_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW(), NOW(), NOW())
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                organization_id = EXCLUDED.organization_id,
                plan_id = COALESCE(EXCLUDED.plan_id, subscriptions.plan_id),
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_price_id = EXCLUDED.stripe_price_id,
                stripe_item_id = EXCLUDED.stripe_item_id,
                status = EXCLUDED.status,
                quantity = EXCLUDED.quantity,
                trial_ends_at = EXCLUDED.trial_ends_at,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                ends_at = EXCLUDED.ends_at,
                paused_at = EXCLUDED.paused_at,
                last_synced_at = NOW(),
                updated_at = NOW()
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(plan_id)
        .bind(&snapshot.stripe_subscription_id)
        .bind(&snapshot.stripe_customer_id)
        .bind(&snapshot.stripe_price_id)
        .bind(&snapshot.stripe_item_id)
        .bind(fields.status.as_str())
        .bind(snapshot.quantity)
        .bind(snapshot.trial_ends_at)
        .bind(snapshot.current_period_start)
        .bind(snapshot.current_period_end)
        .bind(snapshot.cancel_at_period_end)
        .bind(fields.canceled_at)
        .bind(fields.ends_at)
        .bind(fields.paused_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %snapshot.stripe_subscription_id,
            status = %fields.status,
            transition = ?fields.transition,
            "Synced subscription from Stripe"
        );

        Ok(SyncOutcome {
            subscription: record,
            transition: fields.transition,
        })
    }

    /// Record the transition of a sync in the billing timeline
    pub async fn log_transition(
        &self,
        outcome: &SyncOutcome,
        stripe_event_id: Option<&str>,
        actor: Option<Actor>,
    ) {
        let Some(event_type) = outcome.transition.event_type() else {
            return;
        };
        let record = &outcome.subscription;

        let mut builder = BillingEventBuilder::new(record.organization_id, event_type)
            .data(serde_json::json!({
                "status": record.status,
                "plan_id": record.plan_id,
                "stripe_price_id": record.stripe_price_id,
            }))
            .stripe_subscription(&record.stripe_subscription_id);
        builder = match actor {
            Some(actor) => builder.actor(actor.id, actor.kind),
            None => builder.actor_type(ActorType::Stripe),
        };
        if let Some(event_id) = stripe_event_id {
            builder = builder.stripe_event(event_id);
        }

        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log subscription transition");
        }
    }

    async fn log_action(
        &self,
        record: &SubscriptionRecord,
        event_type: BillingEventType,
        actor: Actor,
        data: serde_json::Value,
    ) {
        let builder = BillingEventBuilder::new(record.organization_id, event_type)
            .data(data)
            .stripe_subscription(&record.stripe_subscription_id)
            .actor(actor.id, actor.kind);
        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %e, event_type = event_type.as_str(), "Failed to log billing event");
        }
    }

    async fn org_for_customer(&self, customer_id: &str) -> BillingResult<Uuid> {
        let result: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM organizations WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        result
            .map(|(id,)| id)
            .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
    }

    async fn plan_for_snapshot(&self, snapshot: &SubscriptionSnapshot) -> BillingResult<Option<Uuid>> {
        if let Some(price_id) = snapshot.stripe_price_id.as_deref() {
            let by_price: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM plans WHERE stripe_price_id = $1")
                    .bind(price_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((plan_id,)) = by_price {
                return Ok(Some(plan_id));
            }
        }
        Ok(snapshot.plan_id)
    }

    // ============ CHECKOUT ============

    /// Start a subscription-mode Checkout session for a plan
    pub async fn create_checkout_session(
        &self,
        org_id: Uuid,
        plan: &Plan,
        quantity: u64,
        actor: Actor,
    ) -> BillingResult<CheckoutSessionResult> {
        if !plan.is_active {
            return Err(BillingError::InvalidInput(format!("Plan {} is archived", plan.slug)));
        }
        let price_id = plan
            .stripe_price_id
            .as_deref()
            .ok_or(BillingError::PlanNotSynced(plan.id))?;

        let quantity = if plan.pricing_model == PricingModel::Flat {
            1
        } else if quantity == 0 {
            return Err(BillingError::InvalidInput("Quantity must be at least 1".to_string()));
        } else {
            quantity
        };

        match self.current(org_id).await {
            Ok(existing) => {
                if existing.status()?.is_open() {
                    return Err(BillingError::InvalidState(
                        "Organization already has an open subscription".to_string(),
                    ));
                }
            }
            Err(BillingError::SubscriptionNotFound) => {}
            Err(e) => return Err(e),
        }

        let customer_id = self.ensure_customer(org_id).await?;
        let config = self.stripe.config();

        let form = CheckoutSessionForm {
            mode: "subscription",
            customer: &customer_id,
            client_reference_id: org_id.to_string(),
            success_url: &config.checkout_success_url,
            cancel_url: &config.checkout_cancel_url,
            line_items: vec![CheckoutLineItemForm {
                price: price_id,
                quantity,
            }],
            subscription_data: CheckoutSubscriptionDataForm {
                trial_period_days: (plan.trial_days > 0).then_some(plan.trial_days),
                metadata: checkout_metadata(org_id, plan.id),
            },
            metadata: checkout_metadata(org_id, plan.id),
        };

        let session: stripe::CheckoutSession = self
            .stripe
            .inner()
            .post_form("/checkout/sessions", form)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO pending_checkouts (stripe_session_id, organization_id, plan_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (stripe_session_id) DO NOTHING
            "#,
        )
        .bind(session.id.as_str())
        .bind(org_id)
        .bind(plan.id)
        .execute(&self.pool)
        .await?;

        let builder = BillingEventBuilder::new(org_id, BillingEventType::CheckoutStarted)
            .data(serde_json::json!({
                "plan_id": plan.id,
                "quantity": quantity,
                "session_id": session.id.as_str(),
            }))
            .actor(actor.id, actor.kind);
        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log checkout start");
        }

        tracing::info!(
            org_id = %org_id,
            plan_id = %plan.id,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(CheckoutSessionResult {
            session_id: session.id.to_string(),
            url: session.url,
        })
    }

    /// Mark a checkout as completed once Stripe reports it
    pub async fn complete_checkout(
        &self,
        session_id: &str,
        org_id: Uuid,
        customer_id: Option<&str>,
        stripe_subscription_id: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(customer_id) = customer_id {
            self.record_customer(org_id, customer_id).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO pending_checkouts (stripe_session_id, organization_id, stripe_subscription_id, completed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (stripe_session_id) DO UPDATE SET
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                completed_at = NOW()
            "#,
        )
        .bind(session_id)
        .bind(org_id)
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Clear checkouts whose subscription has been synced
    pub async fn settle_checkouts(&self, org_id: Uuid) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM pending_checkouts p
            WHERE p.organization_id = $1
              AND p.completed_at IS NOT NULL
              AND EXISTS (
                  SELECT 1 FROM subscriptions s
                  WHERE s.stripe_subscription_id = p.stripe_subscription_id
              )
            "#,
        )
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_customer(&self, org_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET stripe_customer_id = $2, updated_at = NOW()
            WHERE id = $1 AND (stripe_customer_id IS NULL OR stripe_customer_id = $2)
            "#,
        )
        .bind(org_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                org_id = %org_id,
                customer_id = %customer_id,
                "Organization already linked to a different Stripe customer"
            );
        }
        Ok(())
    }

    /// Return the org's Stripe customer id, creating the customer if needed
    async fn ensure_customer(&self, org_id: Uuid) -> BillingResult<String> {
        let org: Option<(String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT name, billing_email, stripe_customer_id FROM organizations WHERE id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        let (name, billing_email, existing) =
            org.ok_or_else(|| BillingError::NotFound(format!("Organization {}", org_id)))?;

        if let Some(customer_id) = existing {
            return Ok(customer_id);
        }

        let mut metadata = HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());

        let params = CreateCustomer {
            name: Some(name.as_str()),
            email: billing_email.as_deref(),
            metadata: Some(metadata),
            ..Default::default()
        };
        let customer = Customer::create(self.stripe.inner(), params).await?;

        // A concurrent checkout may have linked a customer first
        let stored: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE organizations
            SET stripe_customer_id = COALESCE(stripe_customer_id, $2), updated_at = NOW()
            WHERE id = $1
            RETURNING stripe_customer_id
            "#,
        )
        .bind(org_id)
        .bind(customer.id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        tracing::info!(org_id = %org_id, customer_id = %customer.id, "Created Stripe customer");

        stored
            .map(|(id,)| id)
            .ok_or_else(|| BillingError::NotFound(format!("Organization {}", org_id)))
    }

    // ============ LIFECYCLE ACTIONS ============

    /// Cancel at period end; status stays as-is until Stripe ends the subscription
    pub async fn cancel(&self, org_id: Uuid, actor: Actor) -> BillingResult<SyncOutcome> {
        let record = self.open_subscription(org_id).await?;
        if record.cancel_at_period_end {
            return Err(BillingError::InvalidState(
                "Cancellation is already scheduled".to_string(),
            ));
        }

        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };
        let subscription =
            Subscription::update(self.stripe.inner(), &record.stripe_id()?, params).await?;

        let outcome = self.sync_from_stripe(&subscription).await?;
        self.log_action(
            &outcome.subscription,
            BillingEventType::CancellationScheduled,
            actor,
            serde_json::json!({ "ends_at": outcome.subscription.ends_at }),
        )
        .await;

        tracing::info!(org_id = %org_id, subscription_id = %subscription.id, "Scheduled cancellation");
        Ok(outcome)
    }

    /// Cancel immediately
    pub async fn cancel_now(&self, org_id: Uuid, actor: Actor) -> BillingResult<SyncOutcome> {
        let record = self.open_subscription(org_id).await?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };
        let subscription =
            Subscription::cancel(self.stripe.inner(), &record.stripe_id()?, params).await?;

        let outcome = self.sync_from_stripe(&subscription).await?;
        self.log_transition(&outcome, None, Some(actor)).await;

        tracing::info!(org_id = %org_id, subscription_id = %subscription.id, "Cancelled subscription");
        Ok(outcome)
    }

    /// Undo a scheduled cancellation while the grace period lasts
    pub async fn resume(&self, org_id: Uuid, actor: Actor) -> BillingResult<SyncOutcome> {
        let record = self.open_subscription(org_id).await?;
        if !record.on_grace_period(OffsetDateTime::now_utc()) {
            return Err(BillingError::InvalidState(
                "Subscription is not on a grace period".to_string(),
            ));
        }

        let params = UpdateSubscription {
            cancel_at_period_end: Some(false),
            ..Default::default()
        };
        let subscription =
            Subscription::update(self.stripe.inner(), &record.stripe_id()?, params).await?;

        let outcome = self.sync_from_stripe(&subscription).await?;
        self.log_action(
            &outcome.subscription,
            BillingEventType::CancellationReverted,
            actor,
            serde_json::json!({}),
        )
        .await;

        tracing::info!(org_id = %org_id, subscription_id = %subscription.id, "Resumed subscription");
        Ok(outcome)
    }

    /// Suspend payment collection
    pub async fn pause(&self, org_id: Uuid, actor: Actor) -> BillingResult<SyncOutcome> {
        let record = self.open_subscription(org_id).await?;
        if !record.status()?.is_entitled() {
            return Err(BillingError::InvalidState(format!(
                "Cannot pause a {} subscription",
                record.status
            )));
        }

        let form = PauseSubscriptionForm {
            pause_collection: PauseCollectionForm { behavior: "void" },
        };
        let subscription: Subscription = self
            .stripe
            .inner()
            .post_form(&format!("/subscriptions/{}", record.stripe_subscription_id), form)
            .await?;

        let outcome = self.sync_from_stripe(&subscription).await?;
        self.log_transition(&outcome, None, Some(actor)).await;
        Ok(outcome)
    }

    /// Resume payment collection
    pub async fn unpause(&self, org_id: Uuid, actor: Actor) -> BillingResult<SyncOutcome> {
        let record = self.open_subscription(org_id).await?;
        if record.status()? != SubscriptionStatus::Paused {
            return Err(BillingError::InvalidState(
                "Subscription is not paused".to_string(),
            ));
        }

        let subscription: Subscription = self
            .stripe
            .inner()
            .post_form(
                &format!("/subscriptions/{}", record.stripe_subscription_id),
                ResumeCollectionForm { pause_collection: "" },
            )
            .await?;

        let outcome = self.sync_from_stripe(&subscription).await?;
        self.log_transition(&outcome, None, Some(actor)).await;
        Ok(outcome)
    }

    /// Move the subscription to another plan's price, prorating the change
    pub async fn migrate_plan(
        &self,
        org_id: Uuid,
        plan: &Plan,
        actor: Actor,
    ) -> BillingResult<MigrationResult> {
        if !plan.is_active {
            return Err(BillingError::InvalidInput(format!("Plan {} is archived", plan.slug)));
        }
        let price_id = plan
            .stripe_price_id
            .as_deref()
            .ok_or(BillingError::PlanNotSynced(plan.id))?;

        let record = self.open_subscription(org_id).await?;
        if !price_change_required(record.stripe_price_id.as_deref(), price_id) {
            tracing::debug!(org_id = %org_id, price_id = %price_id, "Already on plan price");
            return Ok(MigrationResult {
                changed: false,
                subscription: record,
            });
        }

        let item_id = match record.stripe_item_id.clone() {
            Some(id) => id,
            None => {
                let current = self.fetch_from_stripe(&record.stripe_subscription_id).await?;
                current
                    .items
                    .data
                    .first()
                    .map(|item| item.id.to_string())
                    .ok_or_else(|| {
                        BillingError::InvalidState("Subscription has no items".to_string())
                    })?
            }
        };

        let quantity = if plan.pricing_model == PricingModel::Flat {
            1
        } else {
            record.quantity.max(1) as u64
        };

        let mut metadata = HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("plan_id".to_string(), plan.id.to_string());

        let mut params = UpdateSubscription::default();
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item_id),
            price: Some(price_id.to_string()),
            quantity: Some(quantity),
            ..Default::default()
        }]);
        params.proration_behavior = Some(SubscriptionProrationBehavior::CreateProrations);
        params.metadata = Some(metadata);

        let subscription =
            Subscription::update(self.stripe.inner(), &record.stripe_id()?, params).await?;
        let outcome = self.sync_from_stripe(&subscription).await?;

        self.log_action(
            &outcome.subscription,
            BillingEventType::PlanMigrated,
            actor,
            serde_json::json!({
                "from_price_id": record.stripe_price_id,
                "to_price_id": price_id,
                "from_plan_id": record.plan_id,
                "to_plan_id": plan.id,
            }),
        )
        .await;

        tracing::info!(
            org_id = %org_id,
            from_price = ?record.stripe_price_id,
            to_price = %price_id,
            "Migrated subscription to new plan"
        );

        Ok(MigrationResult {
            changed: true,
            subscription: outcome.subscription,
        })
    }

    /// Change the seat count on a quantity-based plan
    pub async fn update_quantity(
        &self,
        org_id: Uuid,
        quantity: u64,
        actor: Actor,
    ) -> BillingResult<SubscriptionRecord> {
        if quantity == 0 {
            return Err(BillingError::InvalidInput("Quantity must be at least 1".to_string()));
        }

        let record = self.open_subscription(org_id).await?;
        let plan_id = record
            .plan_id
            .ok_or_else(|| BillingError::InvalidState("Subscription has no plan".to_string()))?;

        let model: (String,) = sqlx::query_as("SELECT pricing_model FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan_id)))?;
        let model: PricingModel = model
            .0
            .parse()
            .map_err(|e| BillingError::Internal(format!("{}", e)))?;

        if !model.is_quantity_based() {
            return Err(BillingError::InvalidInput(
                "Flat plans do not have a quantity".to_string(),
            ));
        }
        if record.quantity == quantity as i64 {
            return Ok(record);
        }

        let item_id = record
            .stripe_item_id
            .clone()
            .ok_or_else(|| BillingError::InvalidState("Subscription has no items".to_string()))?;

        let mut params = UpdateSubscription::default();
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item_id),
            quantity: Some(quantity),
            ..Default::default()
        }]);
        params.proration_behavior = Some(SubscriptionProrationBehavior::CreateProrations);

        let subscription =
            Subscription::update(self.stripe.inner(), &record.stripe_id()?, params).await?;
        let outcome = self.sync_from_stripe(&subscription).await?;

        self.log_action(
            &outcome.subscription,
            BillingEventType::QuantityChanged,
            actor,
            serde_json::json!({ "from": record.quantity, "to": quantity }),
        )
        .await;

        Ok(outcome.subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn record(status: &str) -> SubscriptionRecord {
        let now = OffsetDateTime::now_utc();
        SubscriptionRecord {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            plan_id: None,
            stripe_subscription_id: "sub_123".to_string(),
            stripe_customer_id: "cus_123".to_string(),
            stripe_price_id: Some("price_a".to_string()),
            stripe_item_id: Some("si_1".to_string()),
            status: status.to_string(),
            quantity: 3,
            trial_ends_at: None,
            current_period_start: Some(now - Duration::days(20)),
            current_period_end: Some(now + Duration::days(10)),
            cancel_at_period_end: false,
            canceled_at: None,
            ends_at: None,
            paused_at: None,
            last_synced_at: now,
            created_at: now,
        }
    }

    #[test]
    fn test_record_status_parses() {
        assert_eq!(record("past_due").status().unwrap(), SubscriptionStatus::PastDue);
        assert!(record("incomplete").status().is_err());
    }

    #[test]
    fn test_record_grace_period() {
        let now = OffsetDateTime::now_utc();
        let mut sub = record("active");
        assert!(!sub.on_grace_period(now));

        sub.cancel_at_period_end = true;
        sub.ends_at = sub.current_period_end;
        assert!(sub.on_grace_period(now));
    }

    #[test]
    fn test_record_stripe_id_parses() {
        assert!(record("active").stripe_id().is_ok());
        let mut bad = record("active");
        bad.stripe_subscription_id = "not-a-sub".to_string();
        assert!(bad.stripe_id().is_err());
    }

    #[test]
    fn test_checkout_form_carries_org_and_plan() {
        let org = Uuid::new_v4();
        let plan = Uuid::new_v4();
        let form = CheckoutSessionForm {
            mode: "subscription",
            customer: "cus_1",
            client_reference_id: org.to_string(),
            success_url: "https://app/ok",
            cancel_url: "https://app/cancel",
            line_items: vec![CheckoutLineItemForm {
                price: "price_1",
                quantity: 5,
            }],
            subscription_data: CheckoutSubscriptionDataForm {
                trial_period_days: None,
                metadata: checkout_metadata(org, plan),
            },
            metadata: checkout_metadata(org, plan),
        };

        let json = serde_json::to_value(&form).unwrap();
        assert_eq!(json["line_items"][0]["quantity"], 5);
        assert_eq!(json["subscription_data"]["metadata"]["plan_id"], plan.to_string());
        assert_eq!(json["metadata"]["org_id"], org.to_string());
        assert!(json["subscription_data"].get("trial_period_days").is_none());
    }

    #[test]
    fn test_pause_forms() {
        let pause = serde_json::to_value(PauseSubscriptionForm {
            pause_collection: PauseCollectionForm { behavior: "void" },
        })
        .unwrap();
        assert_eq!(pause["pause_collection"]["behavior"], "void");

        let resume = serde_json::to_value(ResumeCollectionForm { pause_collection: "" }).unwrap();
        assert_eq!(resume["pause_collection"], "");
    }
}
