//! HTTP routes
//!
//! Everything lives under `/api/v1`. Health and the Stripe webhook are public;
//! every other route runs behind [`require_auth`].

#[cfg(feature = "billing")]
pub mod admin;
pub mod audit;
#[cfg(feature = "billing")]
pub mod billing;
pub mod members;
pub mod organizations;
pub mod permissions;
pub mod roles;
#[cfg(feature = "billing")]
pub mod webhooks;

#[cfg(test)]
mod router_tests;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    auth::require_auth,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 100;

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let protected = Router::new()
        // Organizations
        .route(
            "/organizations",
            get(organizations::list_organizations).post(organizations::create_organization),
        )
        .route(
            "/organizations/{org}",
            get(organizations::get_organization)
                .patch(organizations::update_organization)
                .delete(organizations::delete_organization),
        )
        // Members
        .route(
            "/organizations/{org}/members",
            get(members::list_members).post(members::add_member),
        )
        .route(
            "/organizations/{org}/members/{user}",
            axum::routing::patch(members::update_member).delete(members::remove_member),
        )
        // Roles
        .route(
            "/organizations/{org}/roles",
            get(roles::list_roles).post(roles::create_role),
        )
        .route("/organizations/{org}/roles/{role}", delete(roles::delete_role))
        .route(
            "/organizations/{org}/roles/{role}/permissions/{permission}",
            put(roles::attach_permission).delete(roles::detach_permission),
        )
        // Permissions
        .route("/permissions", get(permissions::list_permissions))
        .route(
            "/organizations/{org}/members/{user}/permissions",
            get(permissions::list_direct_grants).post(permissions::grant_permission),
        )
        .route(
            "/organizations/{org}/members/{user}/permissions/{permission}",
            delete(permissions::revoke_permission),
        )
        .route(
            "/organizations/{org}/authorize",
            get(permissions::check_permission),
        )
        // Audit
        .route(
            "/organizations/{org}/audit-logs",
            get(audit::list_audit_logs),
        );

    #[cfg(feature = "billing")]
    let protected = protected
        .route("/plans", get(billing::list_plans))
        .route(
            "/organizations/{org}/subscription",
            get(billing::get_subscription),
        )
        .route(
            "/organizations/{org}/billing-events",
            get(billing::list_billing_events),
        )
        .route(
            "/organizations/{org}/subscription/checkout",
            post(billing::start_checkout),
        )
        .route(
            "/organizations/{org}/subscription/cancel",
            post(billing::cancel_subscription),
        )
        .route(
            "/organizations/{org}/subscription/cancel-now",
            post(billing::cancel_subscription_now),
        )
        .route(
            "/organizations/{org}/subscription/resume",
            post(billing::resume_subscription),
        )
        .route(
            "/organizations/{org}/subscription/pause",
            post(billing::pause_subscription),
        )
        .route(
            "/organizations/{org}/subscription/unpause",
            post(billing::unpause_subscription),
        )
        .route(
            "/organizations/{org}/subscription/migrate",
            post(billing::migrate_subscription),
        )
        .route(
            "/organizations/{org}/subscription/quantity",
            post(billing::update_quantity),
        )
        // Platform admin
        .route("/admin/billing/invariants", get(admin::check_billing_invariants))
        .route("/admin/webhooks", get(admin::list_webhooks))
        .route("/admin/webhooks/failed", get(admin::list_failed_webhooks))
        .route("/admin/webhooks/replay-failed", post(admin::replay_failed_webhooks))
        .route("/admin/webhooks/{event}/replay", post(admin::replay_webhook))
        .route("/admin/webhooks/{event}/reset", post(admin::reset_webhook))
        .route("/admin/plans", post(admin::create_plan))
        .route("/admin/plans/{plan}", axum::routing::patch(admin::update_plan))
        .route("/admin/plans/{plan}/archive", post(admin::archive_plan));

    let protected =
        protected.route_layer(middleware::from_fn_with_state(auth_state.clone(), require_auth));

    let public = Router::new().route("/health", get(health));

    #[cfg(feature = "billing")]
    let public = public.route(
        "/webhooks/stripe",
        post(webhooks::stripe_webhook).layer(middleware::from_fn_with_state(
            auth_state,
            crate::auth::rate_limit_by_ip,
        )),
    );
    #[cfg(not(feature = "billing"))]
    let _ = auth_state;

    Router::new()
        .nest("/api/v1", public.merge(protected))
        .with_state(state)
}

async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> Json<Value> {
    #[cfg(feature = "billing")]
    let billing = state.billing.is_some();
    #[cfg(not(feature = "billing"))]
    let billing = false;

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "billing": billing,
        "permission_cache": state.authz.backend(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    /// `(limit, offset)` clamped to sane bounds
    pub fn bounds(&self) -> (i64, i64) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

/// Membership role of `user_id` in `organization_id`, if any
pub async fn membership_role(
    pool: &PgPool,
    organization_id: Uuid,
    user_id: Uuid,
) -> ApiResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT role FROM organization_user WHERE organization_id = $1 AND user_id = $2",
    )
    .bind(organization_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(role,)| role))
}

/// Non-members get `NotFound` so organization ids cannot be enumerated
pub async fn require_member(pool: &PgPool, organization_id: Uuid, user_id: Uuid) -> ApiResult<String> {
    membership_role(pool, organization_id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Organization".to_string()))
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// Lowercase letters, digits and single dashes, not at either end
pub fn is_valid_slug(slug: &str) -> bool {
    (2..=63).contains(&slug.len())
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_bounds() {
        assert_eq!(Pagination::default().bounds(), (50, 0));
        let p = Pagination {
            limit: Some(1000),
            offset: Some(-5),
        };
        assert_eq!(p.bounds(), (100, 0));
        let p = Pagination {
            limit: Some(0),
            offset: Some(20),
        };
        assert_eq!(p.bounds(), (1, 20));
    }

    #[test]
    fn test_slug_rules() {
        assert!(is_valid_slug("acme"));
        assert!(is_valid_slug("acme-2"));
        assert!(!is_valid_slug("a"));
        assert!(!is_valid_slug("Acme"));
        assert!(!is_valid_slug("-acme"));
        assert!(!is_valid_slug("acme-"));
        assert!(!is_valid_slug("ac--me"));
        assert!(!is_valid_slug("acme_corp"));
        assert!(!is_valid_slug(&"a".repeat(64)));
    }
}
