//! Membership routes
//!
//! Every membership change flushes the member's `user:` tag in the permission
//! cache, since their role-derived grants in this organization changed.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    audit::{action, record_in, target_type, AuditEntry},
    auth::AuthUser,
    error::{found, ApiError, ApiResult},
    routes::{is_unique_violation, organizations::OWNER_ROLE, require_member},
    state::AppState,
};

#[derive(Debug, Serialize, FromRow)]
pub struct Member {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
}

/// Add an existing user by id or email
#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: String,
}

const MEMBER_QUERY: &str = r#"
    SELECT u.id AS user_id, u.email, u.name, ou.role, ou.created_at AS joined_at
    FROM organization_user ou
    JOIN users u ON u.id = ou.user_id
"#;

/// Whether `role` names a global role or one owned by the organization
pub(crate) async fn role_exists(pool: &PgPool, org_id: Uuid, role: &str) -> ApiResult<bool> {
    let (exists,): (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM roles
            WHERE slug = $2 AND (organization_id IS NULL OR organization_id = $1)
        )
        "#,
    )
    .bind(org_id)
    .bind(role)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Permission slugs carried by the role a membership would be given
async fn role_permissions(pool: &PgPool, org_id: Uuid, role: &str) -> ApiResult<Vec<String>> {
    let permissions: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT p.slug
        FROM roles r
        JOIN role_permissions rp ON rp.role_id = r.id
        JOIN permissions p ON p.id = rp.permission_id
        WHERE r.slug = $2 AND (r.organization_id IS NULL OR r.organization_id = $1)
        ORDER BY p.slug
        "#,
    )
    .bind(org_id)
    .bind(role)
    .fetch_all(pool)
    .await?;
    Ok(permissions)
}

/// Count owners with their membership rows locked until the transaction ends,
/// so two concurrent demotions cannot both see the other owner
async fn owner_count_locked(tx: &mut Transaction<'_, Postgres>, org_id: Uuid) -> ApiResult<i64> {
    let owners: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT user_id FROM organization_user
        WHERE organization_id = $1 AND role = $2
        FOR UPDATE
        "#,
    )
    .bind(org_id)
    .bind(OWNER_ROLE)
    .fetch_all(&mut **tx)
    .await?;
    Ok(owners.len() as i64)
}

/// Whether an organization still has an owner after a member currently in
/// `current_role` moves to `next_role` (`None` when they leave)
fn leaves_an_owner(current_role: &str, next_role: Option<&str>, owners: i64) -> bool {
    if current_role != OWNER_ROLE || next_role == Some(OWNER_ROLE) {
        return true;
    }
    owners > 1
}

fn last_owner_conflict() -> ApiError {
    ApiError::Conflict("An organization must keep at least one owner".to_string())
}

/// Only holders of `organization.delete` (owners) may hand out or take away ownership
async fn guard_owner_change(state: &AppState, actor: &AuthUser, org_id: Uuid) -> ApiResult<()> {
    state
        .authz
        .authorize(actor.user_id, org_id, "organization.delete")
        .await
}

pub async fn list_members(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Member>>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "members.view")
        .await?;

    let members: Vec<Member> = sqlx::query_as(&format!(
        "{} WHERE ou.organization_id = $1 ORDER BY ou.created_at",
        MEMBER_QUERY
    ))
    .bind(org_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(members))
}

pub async fn add_member(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<(StatusCode, Json<Member>)> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "members.manage")
        .await?;

    if !role_exists(&state.pool, org_id, &req.role).await? {
        return Err(ApiError::Validation(format!("Unknown role '{}'", req.role)));
    }
    if req.role == OWNER_ROLE {
        guard_owner_change(&state, &auth_user, org_id).await?;
    }
    let granted = role_permissions(&state.pool, org_id, &req.role).await?;
    state
        .authz
        .authorize_delegation(auth_user.user_id, org_id, &granted)
        .await?;

    let user: Option<(Uuid,)> = match (req.user_id, req.email.as_deref()) {
        (Some(user_id), _) => sqlx::query_as("SELECT id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&state.pool)
            .await?,
        (None, Some(email)) => sqlx::query_as("SELECT id FROM users WHERE lower(email) = lower($1)")
            .bind(email.trim())
            .fetch_optional(&state.pool)
            .await?,
        (None, None) => {
            return Err(ApiError::Validation(
                "Either user_id or email is required".to_string(),
            ))
        }
    };
    let (user_id,) = found(user, "User")?;

    let mut tx = state.pool.begin().await?;

    sqlx::query("INSERT INTO organization_user (organization_id, user_id, role) VALUES ($1, $2, $3)")
        .bind(org_id)
        .bind(user_id)
        .bind(&req.role)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ApiError::Conflict("User is already a member".to_string())
            } else {
                ApiError::Database(e)
            }
        })?;

    record_in(
        &mut *tx,
        AuditEntry::new(action::MEMBER_ADDED, target_type::USER)
            .organization(org_id)
            .actor(&auth_user)
            .target(user_id)
            .details(json!({ "role": req.role })),
    )
    .await?;

    let member: Member = sqlx::query_as(&format!(
        "{} WHERE ou.organization_id = $1 AND ou.user_id = $2",
        MEMBER_QUERY
    ))
    .bind(org_id)
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    state.authz.invalidate_user(user_id).await;

    tracing::info!(org_id = %org_id, user_id = %user_id, role = %req.role, "Member added");
    Ok((StatusCode::CREATED, Json(member)))
}

pub async fn update_member(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateMemberRequest>,
) -> ApiResult<Json<Member>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "members.manage")
        .await?;

    let current = found(
        super::membership_role(&state.pool, org_id, user_id).await?,
        "Member",
    )?;
    if current == req.role {
        let member: Member = sqlx::query_as(&format!(
            "{} WHERE ou.organization_id = $1 AND ou.user_id = $2",
            MEMBER_QUERY
        ))
        .bind(org_id)
        .bind(user_id)
        .fetch_one(&state.pool)
        .await?;
        return Ok(Json(member));
    }

    if !role_exists(&state.pool, org_id, &req.role).await? {
        return Err(ApiError::Validation(format!("Unknown role '{}'", req.role)));
    }
    if current == OWNER_ROLE || req.role == OWNER_ROLE {
        guard_owner_change(&state, &auth_user, org_id).await?;
    }
    let granted = role_permissions(&state.pool, org_id, &req.role).await?;
    state
        .authz
        .authorize_delegation(auth_user.user_id, org_id, &granted)
        .await?;

    let mut tx = state.pool.begin().await?;

    if current == OWNER_ROLE {
        let owners = owner_count_locked(&mut tx, org_id).await?;
        if !leaves_an_owner(&current, Some(req.role.as_str()), owners) {
            return Err(last_owner_conflict());
        }
    }

    sqlx::query(
        r#"
        UPDATE organization_user SET role = $3, updated_at = NOW()
        WHERE organization_id = $1 AND user_id = $2
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .bind(&req.role)
    .execute(&mut *tx)
    .await?;

    record_in(
        &mut *tx,
        AuditEntry::new(action::MEMBER_ROLE_CHANGED, target_type::USER)
            .organization(org_id)
            .actor(&auth_user)
            .target(user_id)
            .details(json!({ "from": current, "to": req.role })),
    )
    .await?;

    let member: Member = sqlx::query_as(&format!(
        "{} WHERE ou.organization_id = $1 AND ou.user_id = $2",
        MEMBER_QUERY
    ))
    .bind(org_id)
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    state.authz.invalidate_user(user_id).await;

    Ok(Json(member))
}

/// Remove a member. Members may always remove themselves.
pub async fn remove_member(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    if user_id != auth_user.user_id {
        state
            .authz
            .authorize(auth_user.user_id, org_id, "members.manage")
            .await?;
    }

    let current = found(
        super::membership_role(&state.pool, org_id, user_id).await?,
        "Member",
    )?;
    if current == OWNER_ROLE && user_id != auth_user.user_id {
        guard_owner_change(&state, &auth_user, org_id).await?;
    }

    let mut tx = state.pool.begin().await?;

    if current == OWNER_ROLE {
        let owners = owner_count_locked(&mut tx, org_id).await?;
        if !leaves_an_owner(&current, None, owners) {
            return Err(last_owner_conflict());
        }
    }

    sqlx::query("DELETE FROM organization_user WHERE organization_id = $1 AND user_id = $2")
        .bind(org_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    // Direct grants do not survive leaving the organization
    let revoked = sqlx::query(
        "DELETE FROM user_permissions WHERE organization_id = $1 AND user_id = $2",
    )
    .bind(org_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    record_in(
        &mut *tx,
        AuditEntry::new(action::MEMBER_REMOVED, target_type::USER)
            .organization(org_id)
            .actor(&auth_user)
            .target(user_id)
            .details(json!({ "role": current, "direct_grants_revoked": revoked })),
    )
    .await?;

    tx.commit().await?;
    state.authz.invalidate_user(user_id).await;

    tracing::info!(org_id = %org_id, user_id = %user_id, "Member removed");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_owner_cannot_leave_or_be_demoted() {
        assert!(!leaves_an_owner(OWNER_ROLE, None, 1));
        assert!(!leaves_an_owner(OWNER_ROLE, Some("admin"), 1));
    }

    #[test]
    fn test_second_owner_can_leave_or_be_demoted() {
        assert!(leaves_an_owner(OWNER_ROLE, None, 2));
        assert!(leaves_an_owner(OWNER_ROLE, Some("member"), 2));
    }

    #[test]
    fn test_non_owner_changes_ignore_owner_count() {
        assert!(leaves_an_owner("admin", None, 0));
        assert!(leaves_an_owner("member", Some("admin"), 1));
        assert!(leaves_an_owner(OWNER_ROLE, Some(OWNER_ROLE), 1));
    }
}
