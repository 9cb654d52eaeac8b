//! Billing invariants
//!
//! Read-only consistency checks over the local billing mirror. They are run
//! on a schedule by the worker and on demand from the admin API, typically
//! after a webhook replay.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    /// Organizations affected; empty for catalog-level checks
    pub org_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customers may be billed incorrectly
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Highest severity among the violations, if any
    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        self.violations
            .iter()
            .map(|v| v.severity)
            .min_by_key(|s| match s {
                ViolationSeverity::Critical => 0,
                ViolationSeverity::High => 1,
                ViolationSeverity::Medium => 2,
                ViolationSeverity::Low => 3,
            })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    organization_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRefRow {
    organization_id: Uuid,
    stripe_subscription_id: String,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CustomerMismatchRow {
    organization_id: Uuid,
    org_customer_id: Option<String>,
    subscription_customer_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UnsyncedPlanRow {
    id: Uuid,
    slug: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckWebhookRow {
    stripe_event_id: String,
    event_type: String,
    processing_started_at: Option<OffsetDateTime>,
}

const CHECKS: [&str; 7] = [
    "single_open_subscription",
    "canceled_has_end_date",
    "scheduled_cancel_has_canceled_at",
    "subscription_has_plan",
    "stripe_customer_matches",
    "active_plans_synced",
    "no_stuck_webhooks",
];

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }
        Ok(InvariantCheckSummary::from_violations(CHECKS.len(), violations))
    }

    /// Run one check by name; unknown names yield no violations
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_open_subscription" => self.check_single_open_subscription().await,
            "canceled_has_end_date" => self.check_canceled_has_end_date().await,
            "scheduled_cancel_has_canceled_at" => self.check_scheduled_cancel().await,
            "subscription_has_plan" => self.check_subscription_has_plan().await,
            "stripe_customer_matches" => self.check_stripe_customer_matches().await,
            "active_plans_synced" => self.check_active_plans_synced().await,
            "no_stuck_webhooks" => self.check_stuck_webhooks().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// More than one open subscription means double billing
    async fn check_single_open_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT organization_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status <> 'canceled'
            GROUP BY organization_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_open_subscription".to_string(),
                org_ids: vec![row.organization_id],
                description: format!(
                    "Organization has {} open subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_canceled_has_end_date(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SubscriptionRefRow> = sqlx::query_as(
            r#"
            SELECT organization_id, stripe_subscription_id, status
            FROM subscriptions
            WHERE status = 'canceled' AND ends_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_end_date".to_string(),
                org_ids: vec![row.organization_id],
                description: format!(
                    "Canceled subscription {} has no ends_at",
                    row.stripe_subscription_id
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_scheduled_cancel(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SubscriptionRefRow> = sqlx::query_as(
            r#"
            SELECT organization_id, stripe_subscription_id, status
            FROM subscriptions
            WHERE cancel_at_period_end AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "scheduled_cancel_has_canceled_at".to_string(),
                org_ids: vec![row.organization_id],
                description: format!(
                    "Subscription {} is scheduled to cancel but has no canceled_at",
                    row.stripe_subscription_id
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// A subscription whose price maps to no plan cannot be migrated or reported on
    async fn check_subscription_has_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SubscriptionRefRow> = sqlx::query_as(
            r#"
            SELECT organization_id, stripe_subscription_id, status
            FROM subscriptions
            WHERE status <> 'canceled' AND plan_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_has_plan".to_string(),
                org_ids: vec![row.organization_id],
                description: format!(
                    "Open subscription {} is not linked to a plan",
                    row.stripe_subscription_id
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_stripe_customer_matches(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CustomerMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                o.id AS organization_id,
                o.stripe_customer_id AS org_customer_id,
                s.stripe_customer_id AS subscription_customer_id
            FROM subscriptions s
            JOIN organizations o ON o.id = s.organization_id
            WHERE s.status <> 'canceled'
              AND o.stripe_customer_id IS DISTINCT FROM s.stripe_customer_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stripe_customer_matches".to_string(),
                org_ids: vec![row.organization_id],
                description: "Organization's Stripe customer differs from its subscription's customer"
                    .to_string(),
                context: serde_json::json!({
                    "org_customer_id": row.org_customer_id,
                    "subscription_customer_id": row.subscription_customer_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_active_plans_synced(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnsyncedPlanRow> = sqlx::query_as(
            r#"
            SELECT id, slug
            FROM plans
            WHERE is_active AND (stripe_product_id IS NULL OR stripe_price_id IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_plans_synced".to_string(),
                org_ids: vec![],
                description: format!("Active plan '{}' has not been pushed to Stripe", row.slug),
                context: serde_json::json!({ "plan_id": row.id, "slug": row.slug }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_stuck_webhooks(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckWebhookRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_started_at
            FROM stripe_webhook_events
            WHERE processing_result IN ('processing', 'replaying')
              AND processing_started_at < NOW() - INTERVAL '30 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhooks".to_string(),
                org_ids: vec![],
                description: format!(
                    "Webhook {} ({}) has been processing for over 30 minutes",
                    row.stripe_event_id, row.event_type
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                    "processing_started_at": row.processing_started_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str, severity: ViolationSeverity) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            org_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::json!({}),
            severity,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 7);
        assert!(checks.contains(&"single_open_subscription"));
        assert!(checks.contains(&"canceled_has_end_date"));
    }

    #[test]
    fn test_summary_counts_failed_checks_not_violations() {
        let summary = InvariantCheckSummary::from_violations(
            7,
            vec![
                violation("single_open_subscription", ViolationSeverity::Critical),
                violation("single_open_subscription", ViolationSeverity::Critical),
                violation("active_plans_synced", ViolationSeverity::Medium),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 5);
        assert!(!summary.healthy);
        assert_eq!(summary.worst_severity(), Some(ViolationSeverity::Critical));
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary = InvariantCheckSummary::from_violations(7, vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 7);
        assert_eq!(summary.worst_severity(), None);
    }
}
