//! Platform admin routes
//!
//! Protected by the user's platform role. Staff can read but not write.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use tenantdesk_billing::{
    InvariantCheckSummary, InvariantChecker, Plan, PlanInput, PlanUpdate, WebhookEventRecord,
    WebhookReplayResult,
};

use crate::{
    audit::{action, target_type, AuditEntry},
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::Pagination,
    state::AppState,
};

/// Upper bound for one bulk replay request
const MAX_BULK_REPLAY: i64 = 500;

const WEBHOOK_STATUSES: &[&str] = &["processing", "success", "error", "replaying", "pending_replay"];

fn require_platform_admin(auth_user: &AuthUser, require_write: bool) -> ApiResult<Uuid> {
    if auth_user.platform_role.can_access_admin(require_write) {
        Ok(auth_user.user_id)
    } else {
        tracing::warn!(
            user_id = %auth_user.user_id,
            platform_role = %auth_user.platform_role.as_str(),
            require_write = require_write,
            "Unauthorized admin access attempt"
        );
        Err(ApiError::Forbidden)
    }
}

// =============================================================================
// Plans
// =============================================================================

pub async fn create_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(input): Json<PlanInput>,
) -> ApiResult<(StatusCode, Json<Plan>)> {
    let admin_id = require_platform_admin(&auth_user, true)?;

    let plan = state.billing()?.plans.create(input).await?;

    state
        .audit
        .record(
            AuditEntry::new(action::PLAN_CREATED, target_type::PLAN)
                .actor(&auth_user)
                .target(plan.id)
                .details(json!({
                    "slug": plan.slug,
                    "pricing_model": plan.pricing_model,
                    "stripe_price_id": plan.stripe_price_id,
                })),
        )
        .await;

    tracing::info!(admin_id = %admin_id, plan_id = %plan.id, slug = %plan.slug, "Plan created");
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(plan_id): Path<Uuid>,
    Json(update): Json<PlanUpdate>,
) -> ApiResult<Json<Plan>> {
    let admin_id = require_platform_admin(&auth_user, true)?;

    let plans = &state.billing()?.plans;
    let before = plans.get(plan_id).await?;
    let plan = plans.update(plan_id, update).await?;

    state
        .audit
        .record(
            AuditEntry::new(action::PLAN_UPDATED, target_type::PLAN)
                .actor(&auth_user)
                .target(plan.id)
                .details(json!({
                    "previous_price_id": before.stripe_price_id,
                    "stripe_price_id": plan.stripe_price_id,
                    "price_changed": before.stripe_price_id != plan.stripe_price_id,
                })),
        )
        .await;

    tracing::info!(admin_id = %admin_id, plan_id = %plan.id, "Plan updated");
    Ok(Json(plan))
}

pub async fn archive_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<Json<Plan>> {
    let admin_id = require_platform_admin(&auth_user, true)?;

    let plan = state.billing()?.plans.archive(plan_id).await?;

    state
        .audit
        .record(
            AuditEntry::new(action::PLAN_ARCHIVED, target_type::PLAN)
                .actor(&auth_user)
                .target(plan.id)
                .details(json!({ "slug": plan.slug })),
        )
        .await;

    tracing::info!(admin_id = %admin_id, plan_id = %plan.id, "Plan archived");
    Ok(Json(plan))
}

// =============================================================================
// Webhooks
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct WebhookListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayFailedQuery {
    pub max: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BulkReplayResponse {
    pub replayed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<WebhookReplayResult>,
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<WebhookListQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    require_platform_admin(&auth_user, false)?;

    if let Some(status) = query.status.as_deref() {
        if !WEBHOOK_STATUSES.contains(&status) {
            return Err(ApiError::Validation(format!("Unknown webhook status '{}'", status)));
        }
    }

    let (limit, offset) = Pagination {
        limit: query.limit,
        offset: query.offset,
    }
    .bounds();

    let records = state
        .billing()?
        .webhooks
        .list_webhooks(query.status.as_deref(), limit, offset)
        .await?;
    Ok(Json(records))
}

/// Events still waiting for a successful replay (error, stuck or queued)
pub async fn list_failed_webhooks(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    require_platform_admin(&auth_user, false)?;

    let (limit, offset) = page.bounds();
    let records = state
        .billing()?
        .webhooks
        .list_failed_webhooks(limit, offset)
        .await?;
    Ok(Json(records))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    let admin_id = require_platform_admin(&auth_user, true)?;

    let result = state.billing()?.webhooks.replay_webhook(&event_id).await?;

    state
        .audit
        .record(
            AuditEntry::new(action::WEBHOOK_REPLAYED, target_type::WEBHOOK_EVENT)
                .actor(&auth_user)
                .target(&event_id)
                .details(json!({
                    "previous_status": result.previous_status,
                    "new_status": result.new_status,
                })),
        )
        .await;

    tracing::info!(admin_id = %admin_id, event_id = %event_id, success = result.success, "Webhook replayed");
    Ok(Json(result))
}

pub async fn replay_failed_webhooks(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ReplayFailedQuery>,
) -> ApiResult<Json<BulkReplayResponse>> {
    let admin_id = require_platform_admin(&auth_user, true)?;

    let max = query.max.unwrap_or(100).clamp(1, MAX_BULK_REPLAY);
    let results = state
        .billing()?
        .webhooks
        .replay_all_failed(Some(max))
        .await?;

    let succeeded = results.iter().filter(|r| r.success).count();
    let response = BulkReplayResponse {
        replayed: results.len(),
        succeeded,
        failed: results.len() - succeeded,
        results,
    };

    state
        .audit
        .record(
            AuditEntry::new(action::WEBHOOK_REPLAYED, target_type::WEBHOOK_EVENT)
                .actor(&auth_user)
                .details(json!({
                    "bulk": true,
                    "replayed": response.replayed,
                    "succeeded": response.succeeded,
                })),
        )
        .await;

    tracing::info!(
        admin_id = %admin_id,
        replayed = response.replayed,
        succeeded = response.succeeded,
        "Bulk webhook replay finished"
    );
    Ok(Json(response))
}

pub async fn reset_webhook(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(event_id): Path<String>,
) -> ApiResult<StatusCode> {
    let admin_id = require_platform_admin(&auth_user, true)?;

    state
        .billing()?
        .webhooks
        .reset_stuck_webhook(&event_id)
        .await?;

    state
        .audit
        .record(
            AuditEntry::new(action::WEBHOOK_RESET, target_type::WEBHOOK_EVENT)
                .actor(&auth_user)
                .target(&event_id),
        )
        .await;

    tracing::info!(admin_id = %admin_id, event_id = %event_id, "Webhook reset for replay");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Invariants
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    /// Run a single named check instead of all of them
    pub check: Option<String>,
}

pub async fn check_billing_invariants(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let admin_id = require_platform_admin(&auth_user, false)?;
    let checker = &state.billing()?.invariants;

    let summary = match query.check.as_deref() {
        Some(name) => {
            if !InvariantChecker::available_checks().contains(&name) {
                return Err(ApiError::Validation(format!("Unknown check '{}'", name)));
            }
            let violations = checker.run_check(name).await?;
            let failed = usize::from(!violations.is_empty());
            InvariantCheckSummary {
                checked_at: time::OffsetDateTime::now_utc(),
                checks_run: 1,
                checks_passed: 1 - failed,
                checks_failed: failed,
                healthy: violations.is_empty(),
                violations,
            }
        }
        None => checker.run_all_checks().await?,
    };

    tracing::info!(
        admin_id = %admin_id,
        healthy = summary.healthy,
        checks_failed = summary.checks_failed,
        "Admin checked billing invariants"
    );
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantdesk_shared::PlatformRole;

    fn user(role: PlatformRole) -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            email: "ops@example.com".to_string(),
            platform_role: role,
            ip_address: None,
            user_agent: None,
        }
    }

    #[test]
    fn test_admin_can_read_and_write() {
        let admin = user(PlatformRole::Admin);
        assert!(require_platform_admin(&admin, false).is_ok());
        assert!(require_platform_admin(&admin, true).is_ok());
    }

    #[test]
    fn test_staff_is_read_only() {
        let staff = user(PlatformRole::Staff);
        assert!(require_platform_admin(&staff, false).is_ok());
        assert!(matches!(
            require_platform_admin(&staff, true),
            Err(ApiError::Forbidden)
        ));
    }

    #[test]
    fn test_regular_user_denied() {
        let regular = user(PlatformRole::User);
        assert!(require_platform_admin(&regular, false).is_err());
        assert!(require_platform_admin(&regular, true).is_err());
    }
}
