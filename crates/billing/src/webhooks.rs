//! Stripe webhook handling
//!
//! Verifies and dispatches Stripe events to the subscription reconciler.
//! Each delivery is claimed atomically in `stripe_webhook_events` so duplicate
//! and concurrent deliveries are processed once.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{
    CheckoutSessionMode, Event, EventObject, EventType, Invoice, Subscription,
    SubscriptionStatus as StripeSubStatus, Webhook,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Claims stuck in `processing` longer than this can be taken over
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Check a `Stripe-Signature` header (`t=…,v1=…`) against the raw payload.
///
/// The signed content is `"{t}.{payload}"` under HMAC-SHA256 keyed with the
/// endpoint secret. Any `v1` entry may match; timestamps outside `tolerance`
/// seconds of `now` are rejected.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => signatures.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // `t` is caller-controlled, so the difference may not fit in an i64
    let tolerance = u64::try_from(tolerance_secs).unwrap_or(0);
    let within_tolerance = now
        .checked_sub(timestamp)
        .map(i64::unsigned_abs)
        .is_some_and(|diff| diff <= tolerance);
    if !within_tolerance {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);

    let matched = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(signed_payload.as_bytes());
        // Constant-time comparison
        mac.verify_slice(&expected).is_ok()
    });

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    subscriptions: SubscriptionService,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone());
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            subscriptions,
            event_logger,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Falls back to manual verification when async-stripe cannot
    /// deserialize an event from a newer Stripe API version.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let config = self.stripe.config();

        match Webhook::construct_event(payload, signature, &config.webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(
            payload,
            signature,
            &config.webhook_secret,
            config.webhook_tolerance_secs,
            now,
        )?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookEventNotSupported(format!("Unparseable event: {}", e))
        })?;

        tracing::debug!(event_type = %event.type_, event_id = %event.id, "Webhook verified manually");
        Ok(event)
    }

    /// Handle a verified Stripe event
    ///
    /// `INSERT ... ON CONFLICT ... RETURNING` claims exclusive processing
    /// rights; a delivery that does not get a row back is a duplicate.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event_id, error = %e, "Failed to claim webhook event");
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            let existing_status: Option<(String,)> = sqlx::query_as(
                "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
            )
            .bind(&event_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();

            let reason = match existing_status {
                Some((status,)) if status == "success" => "already processed",
                Some((status,)) if status == "processing" => "being processed elsewhere",
                Some(_) => "exists with another status",
                None => "unknown",
            };

            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                reason = %reason,
                "Duplicate webhook event skipped"
            );
            return Ok(());
        }

        tracing::info!(event_type = %event.type_, event_id = %event.id, "Processing Stripe webhook event");

        let result = self.process_event_internal(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        // Retried once: a row left in `processing` blocks redelivery for the timeout
        for attempt in 1..=2 {
            let update = sqlx::query(
                r#"
                UPDATE stripe_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE stripe_event_id = $3
                "#,
            )
            .bind(processing_result)
            .bind(&error_message)
            .bind(&event_id)
            .execute(&self.pool)
            .await;

            match update {
                Ok(_) => break,
                Err(e) if attempt == 1 => {
                    tracing::warn!(event_id = %event_id, error = %e, "Webhook result update failed, retrying");
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %event_id,
                        processing_result = %processing_result,
                        error = %e,
                        "Failed to record webhook result; event stays in processing until timeout"
                    );
                }
            }
        }

        result
    }

    async fn process_event_internal(&self, event: &Event) -> BillingResult<()> {
        let event_owned = event.clone();

        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event_owned).await?;
            }
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_changed(event_owned).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event_owned).await?;
            }
            EventType::CustomerSubscriptionTrialWillEnd => {
                self.handle_trial_will_end(event_owned).await?;
            }
            EventType::InvoicePaid => {
                self.handle_invoice(event_owned, BillingEventType::InvoicePaid).await?;
            }
            EventType::InvoicePaymentFailed => {
                self.handle_invoice(event_owned, BillingEventType::InvoicePaymentFailed)
                    .await?;
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Ignoring unhandled Stripe event type"
                );
            }
        }

        Ok(())
    }

    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let session = match event.data.object {
            EventObject::CheckoutSession(session) => session,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        if session.mode != CheckoutSessionMode::Subscription {
            tracing::info!(session_id = %session.id, "Ignoring non-subscription checkout");
            return Ok(());
        }

        let org_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("org_id"))
            .or(session.client_reference_id.as_ref())
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| BillingError::Internal("org_id not found on checkout session".to_string()))?;

        let customer_id = session.customer.as_ref().map(|c| c.id().to_string());
        let subscription_id = session.subscription.as_ref().map(|s| s.id().to_string());

        self.subscriptions
            .complete_checkout(
                session.id.as_str(),
                org_id,
                customer_id.as_deref(),
                subscription_id.as_deref(),
            )
            .await?;

        if let Some(subscription_id) = subscription_id.as_deref() {
            let subscription = self.subscriptions.fetch_from_stripe(subscription_id).await?;
            self.sync_and_log(&subscription, &event_id).await?;
        }

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(org_id, BillingEventType::CheckoutCompleted)
                    .data(serde_json::json!({
                        "session_id": session.id.as_str(),
                        "customer_id": customer_id,
                    }))
                    .stripe_event(&event_id)
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log checkout completion");
        }

        tracing::info!(org_id = %org_id, subscription_id = ?subscription_id, "Checkout completed");
        Ok(())
    }

    async fn handle_subscription_changed(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let subscription = self.extract_subscription(event)?;
        self.sync_and_log(&subscription, &event_id).await?;
        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let mut subscription = self.extract_subscription(event)?;
        // A deleted subscription is over regardless of the status on the payload
        subscription.status = StripeSubStatus::Canceled;
        self.sync_and_log(&subscription, &event_id).await?;
        Ok(())
    }

    async fn handle_trial_will_end(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let subscription = self.extract_subscription(event)?;
        let sub_id = subscription.id.to_string();

        let org_id = match self.get_org_id_from_metadata(&subscription.metadata) {
            Ok(org_id) => org_id,
            Err(_) => self
                .subscriptions
                .find_by_stripe_id(&sub_id)
                .await?
                .map(|record| record.organization_id)
                .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", sub_id)))?,
        };

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(org_id, BillingEventType::TrialEnding)
                    .data(serde_json::json!({ "trial_end": subscription.trial_end }))
                    .stripe_event(&event_id)
                    .stripe_subscription(&sub_id)
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log trial ending event");
        }

        tracing::info!(org_id = %org_id, subscription_id = %sub_id, "Trial ending soon");
        Ok(())
    }

    /// Invoices carry a stale subscription snapshot, so the subscription is re-fetched
    async fn handle_invoice(&self, event: Event, event_type: BillingEventType) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let invoice = self.extract_invoice(event)?;
        let invoice_id = invoice.id.to_string();

        let Some(subscription_id) = invoice.subscription.as_ref().map(|s| s.id().to_string()) else {
            tracing::info!(invoice_id = %invoice_id, "Invoice has no subscription; nothing to reconcile");
            return Ok(());
        };

        let subscription = self.subscriptions.fetch_from_stripe(&subscription_id).await?;
        let org_id = self.sync_and_log(&subscription, &event_id).await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(org_id, event_type)
                    .data(serde_json::json!({
                        "invoice_id": invoice_id,
                        "amount_paid_cents": invoice.amount_paid,
                        "amount_due_cents": invoice.amount_due,
                        "attempt_count": invoice.attempt_count,
                    }))
                    .stripe_event(&event_id)
                    .stripe_subscription(&subscription_id)
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log invoice event");
        }

        if event_type == BillingEventType::InvoicePaymentFailed {
            tracing::warn!(
                org_id = %org_id,
                invoice_id = %invoice_id,
                amount_due = ?invoice.amount_due,
                attempt_count = ?invoice.attempt_count,
                "Invoice payment failed"
            );
        }

        Ok(())
    }

    /// Upsert, record the transition, and clear the org's settled checkouts
    async fn sync_and_log(&self, subscription: &Subscription, event_id: &str) -> BillingResult<Uuid> {
        let outcome = self.subscriptions.sync_from_stripe(subscription).await?;
        let org_id = outcome.subscription.organization_id;

        self.subscriptions
            .log_transition(&outcome, Some(event_id), None)
            .await;

        if let Err(e) = self.subscriptions.settle_checkouts(org_id).await {
            tracing::warn!(org_id = %org_id, error = %e, "Failed to settle pending checkouts");
        }

        Ok(org_id)
    }

    fn extract_subscription(&self, event: Event) -> BillingResult<Subscription> {
        match event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Subscription".to_string(),
            )),
        }
    }

    fn extract_invoice(&self, event: Event) -> BillingResult<Invoice> {
        match event.data.object {
            EventObject::Invoice(invoice) => Ok(invoice),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Invoice".to_string(),
            )),
        }
    }

    fn get_org_id_from_metadata(
        &self,
        metadata: &std::collections::HashMap<String, String>,
    ) -> BillingResult<Uuid> {
        metadata
            .get("org_id")
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| BillingError::Internal("org_id not found in metadata".to_string()))
    }

    // ============ WEBHOOK REPLAY ============

    /// List webhook events, optionally filtered by processing result
    pub async fn list_webhooks(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, event_timestamp,
                   processing_result, processing_started_at, error_message,
                   created_at
            FROM stripe_webhook_events
            WHERE ($1::TEXT IS NULL OR processing_result = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status_filter)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Failed or stuck events that can be replayed
    pub async fn list_failed_webhooks(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, event_timestamp,
                   processing_result, processing_started_at, error_message,
                   created_at
            FROM stripe_webhook_events
            WHERE processing_result IN ('error', 'processing', 'pending_replay')
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Re-fetch an event from Stripe and process it again
    pub async fn replay_webhook(&self, stripe_event_id: &str) -> BillingResult<WebhookReplayResult> {
        tracing::info!(stripe_event_id = %stripe_event_id, "Replaying webhook event");

        let existing: Option<(Uuid, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, processing_result, error_message
            FROM stripe_webhook_events
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .fetch_optional(&self.pool)
        .await?;

        let (record_id, previous_status, previous_error) = existing.ok_or_else(|| {
            BillingError::NotFound(format!("Webhook event {}", stripe_event_id))
        })?;

        let event_id = stripe_event_id
            .parse::<stripe::EventId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid event ID: {}", e)))?;

        let event = Event::retrieve(self.stripe.inner(), &event_id, &[])
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to fetch event from Stripe: {}", e)))?;

        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = 'replaying',
                processing_started_at = NOW(),
                error_message = CONCAT('Replay initiated. Previous status: ', $2::TEXT, '. Previous error: ', COALESCE($3, 'none'))
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .bind(&previous_status)
        .bind(&previous_error)
        .execute(&self.pool)
        .await?;

        let process_result = self.process_event_internal(&event).await;

        let (new_status, new_error) = match &process_result {
            Ok(()) => ("success".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(&new_status)
        .bind(&new_error)
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            previous_status = %previous_status,
            new_status = %new_status,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id,
            stripe_event_id: stripe_event_id.to_string(),
            event_type: event.type_.to_string(),
            previous_status,
            previous_error,
            new_status,
            new_error,
            success: process_result.is_ok(),
        })
    }

    /// Replay every failed (or reset) event, oldest first
    pub async fn replay_all_failed(
        &self,
        max_events: Option<i64>,
    ) -> BillingResult<Vec<WebhookReplayResult>> {
        let limit = max_events.unwrap_or(100);

        let failed_events: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT stripe_event_id
            FROM stripe_webhook_events
            WHERE processing_result IN ('error', 'pending_replay')
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(failed_events.len());

        for (event_id,) in failed_events {
            match self.replay_webhook(&event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(stripe_event_id = %event_id, error = %e, "Failed to replay webhook");
                    results.push(WebhookReplayResult {
                        record_id: Uuid::nil(),
                        stripe_event_id: event_id,
                        event_type: "unknown".to_string(),
                        previous_status: "error".to_string(),
                        previous_error: None,
                        new_status: "error".to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Move a stuck or failed event to `pending_replay`
    pub async fn reset_stuck_webhook(&self, stripe_event_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = 'pending_replay',
                error_message = CONCAT('Reset for replay at ', NOW()::TEXT)
            WHERE stripe_event_id = $1
              AND processing_result IN ('processing', 'error')
            "#,
        )
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Webhook {} not found or not in resettable state",
                stripe_event_id
            )));
        }

        tracing::info!(stripe_event_id = %stripe_event_id, "Webhook reset for replay");
        Ok(())
    }

    /// Delete settled webhook records older than `days`
    pub async fn prune_processed(&self, days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM stripe_webhook_events
            WHERE processing_result = 'success'
              AND created_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Stored webhook event record
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"invoice.paid"}"#;

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_valid_signature() {
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign(PAYLOAD, now, SECRET));
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, now).is_ok());
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let now = 1_700_000_000;
        let header = format!(
            "t={},v1={},v1={},v0=ignored",
            now,
            sign(PAYLOAD, now, "whsec_rotated_out"),
            sign(PAYLOAD, now, SECRET)
        );
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, now).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign(PAYLOAD, now, SECRET));
        let tampered = PAYLOAD.replace("invoice.paid", "invoice.payment_failed");
        assert!(matches!(
            verify_signature(&tampered, &header, SECRET, 300, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign(PAYLOAD, now, "whsec_other"));
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, now).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let signed_at = 1_700_000_000;
        let header = format!("t={},v1={}", signed_at, sign(PAYLOAD, signed_at, SECRET));
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, signed_at + 301).is_err());
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, signed_at + 300).is_ok());
        // Clock skew in the other direction
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, signed_at - 301).is_err());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let now = 1_700_000_000;
        let sig = sign(PAYLOAD, now, SECRET);
        for header in [
            String::new(),
            format!("v1={}", sig),
            format!("t={}", now),
            format!("t=abc,v1={}", sig),
            format!("t={},v1=not-hex", now),
            "garbage".to_string(),
            format!("t={},v1={}", i64::MIN, sig),
            format!("t={},v1={}", i64::MAX, sig),
        ] {
            assert!(
                verify_signature(PAYLOAD, &header, SECRET, 300, now).is_err(),
                "header should be rejected: {header:?}"
            );
        }
    }

    #[test]
    fn test_extreme_timestamps_rejected_at_any_clock() {
        let sig = sign(PAYLOAD, 0, SECRET);
        for now in [i64::MIN, -1, 0, 1_700_000_000, i64::MAX] {
            for t in [i64::MIN, i64::MAX] {
                let header = format!("t={},v1={}", t, sig);
                assert!(
                    verify_signature(PAYLOAD, &header, SECRET, 300, now).is_err(),
                    "t={t} now={now} should be rejected"
                );
            }
        }
    }
}
