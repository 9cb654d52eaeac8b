//! Subscription routes
//!
//! Every state-changing route goes through `SubscriptionService`, which calls
//! Stripe first and then writes the returned object locally. Nothing here
//! touches `subscriptions.status` directly.

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use tenantdesk_billing::{
    Actor, BillingEventRecord, CheckoutSessionResult, MigrationResult, Plan, SubscriptionRecord,
    SyncOutcome, Transition,
};

use crate::{
    audit::{action, target_type, AuditEntry},
    auth::AuthUser,
    error::{ensure, ApiResult},
    routes::{require_member, Pagination},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    #[serde(flatten)]
    pub subscription: SubscriptionRecord,
    pub on_grace_period: bool,
}

impl From<SubscriptionRecord> for SubscriptionResponse {
    fn from(subscription: SubscriptionRecord) -> Self {
        let on_grace_period = subscription.on_grace_period(OffsetDateTime::now_utc());
        Self {
            subscription,
            on_grace_period,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubscriptionChangeResponse {
    pub subscription: SubscriptionResponse,
    pub transition: Transition,
}

impl From<SyncOutcome> for SubscriptionChangeResponse {
    fn from(outcome: SyncOutcome) -> Self {
        Self {
            subscription: outcome.subscription.into(),
            transition: outcome.transition,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan_id: Uuid,
    #[serde(default = "default_quantity")]
    pub quantity: u64,
}

fn default_quantity() -> u64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub plan_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct QuantityRequest {
    pub quantity: u64,
}

async fn authorize_manage(state: &AppState, auth_user: &AuthUser, org_id: Uuid) -> ApiResult<()> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "billing.manage")
        .await
}

fn audit_entry(
    auth_user: &AuthUser,
    org_id: Uuid,
    action: &'static str,
    subscription: &SubscriptionRecord,
) -> AuditEntry {
    AuditEntry::new(action, target_type::SUBSCRIPTION)
        .organization(org_id)
        .actor(auth_user)
        .target(&subscription.stripe_subscription_id)
        .details(json!({ "status": subscription.status }))
}

pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    let plans = state.billing()?.plans.list(false).await?;
    Ok(Json(plans))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionResponse>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "billing.view")
        .await?;

    let subscription = state.billing()?.subscriptions.current(org_id).await?;
    Ok(Json(subscription.into()))
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub limit: Option<i64>,
}

/// Billing timeline for an organization, newest first
pub async fn list_billing_events(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<Json<Vec<BillingEventRecord>>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "billing.view")
        .await?;

    let (limit, _) = Pagination {
        limit: query.limit,
        offset: None,
    }
    .bounds();
    let events = state.billing()?.events.recent(org_id, limit).await?;
    Ok(Json(events))
}

pub async fn start_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutSessionResult>> {
    authorize_manage(&state, &auth_user, org_id).await?;
    ensure(req.quantity >= 1, "quantity must be at least 1")?;

    let billing = state.billing()?;
    let plan = billing.plans.get(req.plan_id).await?;
    let session = billing
        .subscriptions
        .create_checkout_session(org_id, &plan, req.quantity, Actor::user(auth_user.user_id))
        .await?;

    state
        .audit
        .record(
            AuditEntry::new(action::SUBSCRIPTION_CHECKOUT, target_type::PLAN)
                .organization(org_id)
                .actor(&auth_user)
                .target(plan.id)
                .details(json!({
                    "plan": plan.slug,
                    "quantity": req.quantity,
                    "session_id": session.session_id,
                })),
        )
        .await;

    Ok(Json(session))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionChangeResponse>> {
    authorize_manage(&state, &auth_user, org_id).await?;

    let outcome = state
        .billing()?
        .subscriptions
        .cancel(org_id, Actor::user(auth_user.user_id))
        .await?;

    state
        .audit
        .record(audit_entry(&auth_user, org_id, action::SUBSCRIPTION_CANCELED, &outcome.subscription))
        .await;
    Ok(Json(outcome.into()))
}

pub async fn cancel_subscription_now(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionChangeResponse>> {
    authorize_manage(&state, &auth_user, org_id).await?;

    let outcome = state
        .billing()?
        .subscriptions
        .cancel_now(org_id, Actor::user(auth_user.user_id))
        .await?;

    state
        .audit
        .record(audit_entry(&auth_user, org_id, action::SUBSCRIPTION_CANCELED_NOW, &outcome.subscription))
        .await;
    Ok(Json(outcome.into()))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionChangeResponse>> {
    authorize_manage(&state, &auth_user, org_id).await?;

    let outcome = state
        .billing()?
        .subscriptions
        .resume(org_id, Actor::user(auth_user.user_id))
        .await?;

    state
        .audit
        .record(audit_entry(&auth_user, org_id, action::SUBSCRIPTION_RESUMED, &outcome.subscription))
        .await;
    Ok(Json(outcome.into()))
}

pub async fn pause_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionChangeResponse>> {
    authorize_manage(&state, &auth_user, org_id).await?;

    let outcome = state
        .billing()?
        .subscriptions
        .pause(org_id, Actor::user(auth_user.user_id))
        .await?;

    state
        .audit
        .record(audit_entry(&auth_user, org_id, action::SUBSCRIPTION_PAUSED, &outcome.subscription))
        .await;
    Ok(Json(outcome.into()))
}

pub async fn unpause_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionChangeResponse>> {
    authorize_manage(&state, &auth_user, org_id).await?;

    let outcome = state
        .billing()?
        .subscriptions
        .unpause(org_id, Actor::user(auth_user.user_id))
        .await?;

    state
        .audit
        .record(audit_entry(&auth_user, org_id, action::SUBSCRIPTION_UNPAUSED, &outcome.subscription))
        .await;
    Ok(Json(outcome.into()))
}

pub async fn migrate_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<MigrateRequest>,
) -> ApiResult<Json<MigrationResult>> {
    authorize_manage(&state, &auth_user, org_id).await?;

    let billing = state.billing()?;
    let plan = billing.plans.get(req.plan_id).await?;
    let result = billing
        .subscriptions
        .migrate_plan(org_id, &plan, Actor::user(auth_user.user_id))
        .await?;

    if result.changed {
        state
            .audit
            .record(
                audit_entry(&auth_user, org_id, action::SUBSCRIPTION_MIGRATED, &result.subscription)
                    .details(json!({ "plan": plan.slug, "price": plan.stripe_price_id })),
            )
            .await;
    }
    Ok(Json(result))
}

pub async fn update_quantity(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<QuantityRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    authorize_manage(&state, &auth_user, org_id).await?;

    let subscription = state
        .billing()?
        .subscriptions
        .update_quantity(org_id, req.quantity, Actor::user(auth_user.user_id))
        .await?;

    state
        .audit
        .record(
            audit_entry(&auth_user, org_id, action::SUBSCRIPTION_QUANTITY, &subscription)
                .details(json!({ "quantity": req.quantity })),
        )
        .await;
    Ok(Json(subscription.into()))
}
