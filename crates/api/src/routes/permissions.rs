//! Permission catalog, direct grants and permission checks

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    audit::{action, record_in, target_type, AuditEntry},
    auth::AuthUser,
    error::{ensure, found, ApiError, ApiResult},
    routes::{membership_role, require_member},
    state::AppState,
};

#[derive(Debug, Serialize, FromRow)]
pub struct Permission {
    pub id: Uuid,
    pub slug: String,
    pub description: String,
}

#[derive(Debug, Serialize, FromRow)]
pub struct DirectGrant {
    pub permission: String,
    pub granted_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub permission: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub permission: String,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub permission: String,
    pub allowed: bool,
}

pub async fn list_permissions(State(state): State<AppState>) -> ApiResult<Json<Vec<Permission>>> {
    let permissions: Vec<Permission> =
        sqlx::query_as("SELECT id, slug, description FROM permissions ORDER BY slug")
            .fetch_all(&state.pool)
            .await?;
    Ok(Json(permissions))
}

/// Direct grants of a member. Members can always read their own.
pub async fn list_direct_grants(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<DirectGrant>>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    if user_id != auth_user.user_id {
        state
            .authz
            .authorize(auth_user.user_id, org_id, "permissions.manage")
            .await?;
    }

    let grants: Vec<DirectGrant> = sqlx::query_as(
        r#"
        SELECT p.slug AS permission, up.granted_by, up.created_at
        FROM user_permissions up
        JOIN permissions p ON p.id = up.permission_id
        WHERE up.organization_id = $1 AND up.user_id = $2
        ORDER BY p.slug
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(grants))
}

pub async fn grant_permission(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<GrantRequest>,
) -> ApiResult<StatusCode> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "permissions.manage")
        .await?;

    found(
        membership_role(&state.pool, org_id, user_id).await?,
        "Member",
    )?;

    let permission: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM permissions WHERE slug = $1")
        .bind(&req.permission)
        .fetch_optional(&state.pool)
        .await?;
    let (permission_id,) = permission
        .ok_or_else(|| ApiError::Validation(format!("Unknown permission '{}'", req.permission)))?;

    state
        .authz
        .authorize_delegation(auth_user.user_id, org_id, std::slice::from_ref(&req.permission))
        .await?;

    let mut tx = state.pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO user_permissions (user_id, organization_id, permission_id, granted_by)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(org_id)
    .bind(permission_id)
    .bind(auth_user.user_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        return Ok(StatusCode::OK);
    }

    record_in(
        &mut *tx,
        AuditEntry::new(action::PERMISSION_GRANTED, target_type::USER)
            .organization(org_id)
            .actor(&auth_user)
            .target(user_id)
            .details(json!({ "permission": req.permission })),
    )
    .await?;

    tx.commit().await?;
    state.authz.invalidate_user(user_id).await;

    Ok(StatusCode::CREATED)
}

pub async fn revoke_permission(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((org_id, user_id, permission)): Path<(Uuid, Uuid, String)>,
) -> ApiResult<StatusCode> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "permissions.manage")
        .await?;

    let mut tx = state.pool.begin().await?;

    let removed = sqlx::query(
        r#"
        DELETE FROM user_permissions
        WHERE user_id = $1
          AND organization_id = $2
          AND permission_id = (SELECT id FROM permissions WHERE slug = $3)
        "#,
    )
    .bind(user_id)
    .bind(org_id)
    .bind(&permission)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if removed == 0 {
        return Err(ApiError::NotFound("Grant".to_string()));
    }

    record_in(
        &mut *tx,
        AuditEntry::new(action::PERMISSION_REVOKED, target_type::USER)
            .organization(org_id)
            .actor(&auth_user)
            .target(user_id)
            .details(json!({ "permission": permission })),
    )
    .await?;

    tx.commit().await?;
    state.authz.invalidate_user(user_id).await;

    Ok(StatusCode::NO_CONTENT)
}

/// Whether the caller holds `permission` in the organization
pub async fn check_permission(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<CheckQuery>,
) -> ApiResult<Json<CheckResponse>> {
    ensure(!query.permission.trim().is_empty(), "permission is required")?;
    require_member(&state.pool, org_id, auth_user.user_id).await?;

    let allowed = state
        .authz
        .check(auth_user.user_id, org_id, &query.permission)
        .await?;

    Ok(Json(CheckResponse {
        permission: query.permission,
        allowed,
    }))
}
