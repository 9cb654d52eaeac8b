//! Audit log
//!
//! Append-only record of who did what. Rows are only ever inserted; the table
//! carries a trigger rejecting updates and deletes.

use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiResult;

pub mod action {
    pub const ORGANIZATION_CREATED: &str = "organization.created";
    pub const ORGANIZATION_UPDATED: &str = "organization.updated";
    pub const ORGANIZATION_DELETED: &str = "organization.deleted";
    pub const MEMBER_ADDED: &str = "member.added";
    pub const MEMBER_ROLE_CHANGED: &str = "member.role_changed";
    pub const MEMBER_REMOVED: &str = "member.removed";
    pub const ROLE_CREATED: &str = "role.created";
    pub const ROLE_DELETED: &str = "role.deleted";
    pub const ROLE_PERMISSION_ATTACHED: &str = "role.permission_attached";
    pub const ROLE_PERMISSION_DETACHED: &str = "role.permission_detached";
    pub const PERMISSION_GRANTED: &str = "permission.granted";
    pub const PERMISSION_REVOKED: &str = "permission.revoked";
    pub const SUBSCRIPTION_CHECKOUT: &str = "subscription.checkout_started";
    pub const SUBSCRIPTION_CANCELED: &str = "subscription.canceled";
    pub const SUBSCRIPTION_CANCELED_NOW: &str = "subscription.canceled_immediately";
    pub const SUBSCRIPTION_RESUMED: &str = "subscription.resumed";
    pub const SUBSCRIPTION_PAUSED: &str = "subscription.paused";
    pub const SUBSCRIPTION_UNPAUSED: &str = "subscription.unpaused";
    pub const SUBSCRIPTION_MIGRATED: &str = "subscription.plan_migrated";
    pub const SUBSCRIPTION_QUANTITY: &str = "subscription.quantity_changed";
    pub const PLAN_CREATED: &str = "plan.created";
    pub const PLAN_UPDATED: &str = "plan.updated";
    pub const PLAN_ARCHIVED: &str = "plan.archived";
    pub const WEBHOOK_REPLAYED: &str = "webhook.replayed";
    pub const WEBHOOK_RESET: &str = "webhook.reset";
}

pub mod target_type {
    pub const ORGANIZATION: &str = "organization";
    pub const USER: &str = "user";
    pub const ROLE: &str = "role";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const PLAN: &str = "plan";
    pub const WEBHOOK_EVENT: &str = "webhook_event";
}

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "password_hash",
    "token",
    "api_key",
    "secret",
    "private_key",
    "credit_card",
    "card_number",
    "bearer_token",
];

/// Redact sensitive keys at any depth
pub fn sanitize_pii(mut details: serde_json::Value) -> serde_json::Value {
    redact(&mut details);
    details
}

fn redact(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&key.to_lowercase().as_str()) {
                    *inner = serde_json::json!("[REDACTED]");
                } else {
                    redact(inner);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    organization_id: Option<Uuid>,
    actor_id: Option<Uuid>,
    action: &'static str,
    target_type: &'static str,
    target_id: Option<String>,
    details: serde_json::Value,
    ip_address: Option<String>,
    user_agent: Option<String>,
}

impl AuditEntry {
    pub fn new(action: &'static str, target_type: &'static str) -> Self {
        Self {
            organization_id: None,
            actor_id: None,
            action,
            target_type,
            target_id: None,
            details: serde_json::json!({}),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    /// Actor plus request context
    pub fn actor(mut self, user: &AuthUser) -> Self {
        self.actor_id = Some(user.user_id);
        self.ip_address = user.ip_address.clone();
        self.user_agent = user.user_agent.clone();
        self
    }

    pub fn target(mut self, target_id: impl ToString) -> Self {
        self.target_id = Some(target_id.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Insert an entry on any executor, typically the transaction making the change
pub async fn record_in<'e, E>(executor: E, entry: AuditEntry) -> Result<Uuid, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO audit_logs (
            id, organization_id, actor_id, action, target_type, target_id,
            details, ip_address, user_agent
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(id)
    .bind(entry.organization_id)
    .bind(entry.actor_id)
    .bind(entry.action)
    .bind(entry.target_type)
    .bind(entry.target_id)
    .bind(sanitize_pii(entry.details))
    .bind(entry.ip_address)
    .bind(entry.user_agent)
    .execute(executor)
    .await?;

    Ok(id)
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditLogRecord {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub target_type: String,
    pub target_id: Option<String>,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record outside a transaction. Used after external calls (Stripe) that
    /// cannot be rolled back, so a failed insert is logged and not returned.
    pub async fn record(&self, entry: AuditEntry) {
        let action = entry.action;
        if let Err(e) = record_in(&self.pool, entry).await {
            tracing::error!(error = %e, action = %action, "Failed to write audit log");
        }
    }

    /// Newest first
    pub async fn list(
        &self,
        organization_id: Uuid,
        action: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> ApiResult<Vec<AuditLogRecord>> {
        let records = sqlx::query_as(
            r#"
            SELECT id, organization_id, actor_id, action, target_type, target_id,
                   details, ip_address, created_at
            FROM audit_logs
            WHERE organization_id = $1
              AND ($2::TEXT IS NULL OR action = $2)
            ORDER BY created_at DESC, id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(organization_id)
        .bind(action)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
