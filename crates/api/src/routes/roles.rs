//! Role routes
//!
//! Organizations see the global roles plus their own. Org-scoped roles are
//! managed with `roles.manage`; changing the permissions of a global role is a
//! platform-admin action and flushes every cached decision.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::{action, record_in, target_type, AuditEntry},
    auth::AuthUser,
    error::{ensure, found, ApiError, ApiResult},
    routes::{is_unique_violation, is_valid_slug, require_member},
    state::AppState,
};

#[derive(Debug, Serialize, FromRow)]
pub struct Role {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub slug: String,
    pub name: String,
    pub permissions: Vec<String>,
}

impl Role {
    pub fn is_global(&self) -> bool {
        self.organization_id.is_none()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

const ROLE_QUERY: &str = r#"
    SELECT r.id, r.organization_id, r.slug, r.name,
           COALESCE(
               ARRAY_AGG(p.slug ORDER BY p.slug) FILTER (WHERE p.slug IS NOT NULL),
               '{}'
           ) AS permissions
    FROM roles r
    LEFT JOIN role_permissions rp ON rp.role_id = r.id
    LEFT JOIN permissions p ON p.id = rp.permission_id
"#;

/// Role visible from `org_id`: global, or owned by that organization
async fn visible_role(state: &AppState, org_id: Uuid, role_id: Uuid) -> ApiResult<Role> {
    let role: Option<Role> = sqlx::query_as(&format!(
        r#"{}
        WHERE r.id = $1 AND (r.organization_id IS NULL OR r.organization_id = $2)
        GROUP BY r.id"#,
        ROLE_QUERY
    ))
    .bind(role_id)
    .bind(org_id)
    .fetch_optional(&state.pool)
    .await?;

    found(role, "Role")
}

/// Permission on an org-scoped role needs `roles.manage`; on a global role it
/// needs platform admin write access
async fn authorize_role_edit(
    state: &AppState,
    auth_user: &AuthUser,
    org_id: Uuid,
    role: &Role,
) -> ApiResult<()> {
    if role.is_global() {
        if !auth_user.platform_role.can_access_admin(true) {
            tracing::warn!(
                user_id = %auth_user.user_id,
                role = %role.slug,
                "Non-admin attempted to change a global role"
            );
            return Err(ApiError::Forbidden);
        }
        Ok(())
    } else {
        state
            .authz
            .authorize(auth_user.user_id, org_id, "roles.manage")
            .await
    }
}

async fn invalidate_for_role(state: &AppState, org_id: Uuid, role: &Role) {
    if role.is_global() {
        state.authz.invalidate_all().await;
    } else {
        state.authz.invalidate_organization(org_id).await;
    }
}

pub async fn list_roles(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Role>>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "members.view")
        .await?;

    let roles: Vec<Role> = sqlx::query_as(&format!(
        r#"{}
        WHERE r.organization_id IS NULL OR r.organization_id = $1
        GROUP BY r.id
        ORDER BY r.organization_id NULLS FIRST, r.slug"#,
        ROLE_QUERY
    ))
    .bind(org_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(roles))
}

pub async fn create_role(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<CreateRoleRequest>,
) -> ApiResult<(StatusCode, Json<Role>)> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "roles.manage")
        .await?;

    ensure(is_valid_slug(&req.slug), "Role slug must be 2-63 lowercase letters, digits or dashes")?;
    ensure(!req.name.trim().is_empty(), "Role name is required")?;

    // Membership roles resolve by slug, so an org role may not shadow a global one
    let (shadows_global,): (bool,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM roles WHERE slug = $1 AND organization_id IS NULL)",
    )
    .bind(&req.slug)
    .fetch_one(&state.pool)
    .await?;
    if shadows_global {
        return Err(ApiError::Conflict(format!(
            "'{}' is a built-in role",
            req.slug
        )));
    }

    state
        .authz
        .authorize_delegation(auth_user.user_id, org_id, &req.permissions)
        .await?;

    let mut tx = state.pool.begin().await?;
    let role_id = Uuid::new_v4();

    sqlx::query("INSERT INTO roles (id, organization_id, slug, name) VALUES ($1, $2, $3, $4)")
        .bind(role_id)
        .bind(org_id)
        .bind(&req.slug)
        .bind(req.name.trim())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ApiError::Conflict(format!("Role '{}' already exists", req.slug))
            } else {
                ApiError::Database(e)
            }
        })?;

    if !req.permissions.is_empty() {
        let attached = sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id)
            SELECT $1, id FROM permissions WHERE slug = ANY($2)
            "#,
        )
        .bind(role_id)
        .bind(&req.permissions)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if attached as usize != req.permissions.len() {
            return Err(ApiError::Validation(
                "permissions contains an unknown or duplicate slug".to_string(),
            ));
        }
    }

    record_in(
        &mut *tx,
        AuditEntry::new(action::ROLE_CREATED, target_type::ROLE)
            .organization(org_id)
            .actor(&auth_user)
            .target(role_id)
            .details(json!({ "slug": req.slug, "permissions": req.permissions })),
    )
    .await?;

    tx.commit().await?;

    let role = visible_role(&state, org_id, role_id).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

pub async fn delete_role(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((org_id, role_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "roles.manage")
        .await?;

    let role = visible_role(&state, org_id, role_id).await?;
    if role.is_global() {
        return Err(ApiError::Forbidden);
    }

    let (assigned,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM organization_user WHERE organization_id = $1 AND role = $2",
    )
    .bind(org_id)
    .bind(&role.slug)
    .fetch_one(&state.pool)
    .await?;
    if assigned > 0 {
        return Err(ApiError::Conflict(format!(
            "Role '{}' is still assigned to {} member(s)",
            role.slug, assigned
        )));
    }

    let mut tx = state.pool.begin().await?;

    sqlx::query("DELETE FROM roles WHERE id = $1")
        .bind(role_id)
        .execute(&mut *tx)
        .await?;

    record_in(
        &mut *tx,
        AuditEntry::new(action::ROLE_DELETED, target_type::ROLE)
            .organization(org_id)
            .actor(&auth_user)
            .target(role_id)
            .details(json!({ "slug": role.slug })),
    )
    .await?;

    tx.commit().await?;
    state.authz.invalidate_organization(org_id).await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn attach_permission(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((org_id, role_id, permission)): Path<(Uuid, Uuid, String)>,
) -> ApiResult<Json<Role>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    let role = visible_role(&state, org_id, role_id).await?;
    authorize_role_edit(&state, &auth_user, org_id, &role).await?;
    // Global roles are platform-admin edits and not bounded by org grants
    if !role.is_global() {
        state
            .authz
            .authorize_delegation(auth_user.user_id, org_id, std::slice::from_ref(&permission))
            .await?;
    }

    let mut tx = state.pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO role_permissions (role_id, permission_id)
        SELECT $1, id FROM permissions WHERE slug = $2
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(role_id)
    .bind(&permission)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 && !role.permissions.contains(&permission) {
        return Err(ApiError::NotFound(format!("Permission '{}'", permission)));
    }

    if inserted > 0 {
        record_in(
            &mut *tx,
            AuditEntry::new(action::ROLE_PERMISSION_ATTACHED, target_type::ROLE)
                .organization(org_id)
                .actor(&auth_user)
                .target(role_id)
                .details(json!({ "role": role.slug, "permission": permission, "global": role.is_global() })),
        )
        .await?;
    }

    tx.commit().await?;
    if inserted > 0 {
        invalidate_for_role(&state, org_id, &role).await;
    }

    Ok(Json(visible_role(&state, org_id, role_id).await?))
}

pub async fn detach_permission(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((org_id, role_id, permission)): Path<(Uuid, Uuid, String)>,
) -> ApiResult<Json<Role>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    let role = visible_role(&state, org_id, role_id).await?;
    authorize_role_edit(&state, &auth_user, org_id, &role).await?;

    let mut tx = state.pool.begin().await?;

    let removed = sqlx::query(
        r#"
        DELETE FROM role_permissions
        WHERE role_id = $1
          AND permission_id = (SELECT id FROM permissions WHERE slug = $2)
        "#,
    )
    .bind(role_id)
    .bind(&permission)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if removed > 0 {
        record_in(
            &mut *tx,
            AuditEntry::new(action::ROLE_PERMISSION_DETACHED, target_type::ROLE)
                .organization(org_id)
                .actor(&auth_user)
                .target(role_id)
                .details(json!({ "role": role.slug, "permission": permission, "global": role.is_global() })),
        )
        .await?;
    }

    tx.commit().await?;
    if removed > 0 {
        invalidate_for_role(&state, org_id, &role).await;
    }

    Ok(Json(visible_role(&state, org_id, role_id).await?))
}
