//! Organization routes

use axum::{
    extract::{Extension, Path, State},
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
    routes::{is_unique_violation, is_valid_slug, require_member},
    state::AppState,
};

/// Role given to whoever creates an organization
pub const OWNER_ROLE: &str = "owner";

const MAX_NAME_LEN: usize = 120;

#[derive(Debug, Serialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub billing_email: Option<String>,
    pub stripe_customer_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Serialize, FromRow)]
pub struct OrganizationMembership {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrganizationRequest {
    pub name: String,
    pub slug: Option<String>,
    pub billing_email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrganizationRequest {
    pub name: Option<String>,
    pub billing_email: Option<String>,
}

const ORGANIZATION_COLUMNS: &str =
    "id, name, slug, billing_email, stripe_customer_id, created_at, updated_at";

/// Derive a slug from a display name
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').chars().take(63).collect::<String>().trim_end_matches('-').to_string()
}

fn validate_name(name: &str) -> ApiResult<()> {
    ensure(!name.trim().is_empty(), "Name is required")?;
    ensure(
        name.trim().len() <= MAX_NAME_LEN,
        format!("Name must be at most {} characters", MAX_NAME_LEN),
    )
}

fn validate_email(email: &str) -> ApiResult<()> {
    let valid = email
        .split_once('@')
        .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
        .unwrap_or(false);
    ensure(valid, "billing_email is not a valid email address")
}

pub async fn create_organization(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateOrganizationRequest>,
) -> ApiResult<(StatusCode, Json<Organization>)> {
    validate_name(&req.name)?;
    let slug = req.slug.clone().unwrap_or_else(|| slugify(&req.name));
    ensure(is_valid_slug(&slug), "Slug must be 2-63 lowercase letters, digits or dashes")?;
    if let Some(email) = req.billing_email.as_deref() {
        validate_email(email)?;
    }

    let mut tx = state.pool.begin().await?;

    let org: Organization = sqlx::query_as(&format!(
        r#"
        INSERT INTO organizations (id, name, slug, billing_email)
        VALUES ($1, $2, $3, $4)
        RETURNING {}
        "#,
        ORGANIZATION_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(req.name.trim())
    .bind(&slug)
    .bind(&req.billing_email)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            ApiError::Conflict(format!("Slug '{}' is already taken", slug))
        } else {
            ApiError::Database(e)
        }
    })?;

    sqlx::query("INSERT INTO organization_user (organization_id, user_id, role) VALUES ($1, $2, $3)")
        .bind(org.id)
        .bind(auth_user.user_id)
        .bind(OWNER_ROLE)
        .execute(&mut *tx)
        .await?;

    record_in(
        &mut *tx,
        AuditEntry::new(action::ORGANIZATION_CREATED, target_type::ORGANIZATION)
            .organization(org.id)
            .actor(&auth_user)
            .target(org.id)
            .details(json!({ "name": org.name, "slug": org.slug })),
    )
    .await?;

    tx.commit().await?;

    // Cached denials for this user in the new org would otherwise linger
    state.authz.invalidate_user(auth_user.user_id).await;

    tracing::info!(org_id = %org.id, user_id = %auth_user.user_id, slug = %org.slug, "Organization created");
    Ok((StatusCode::CREATED, Json(org)))
}

pub async fn list_organizations(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<OrganizationMembership>>> {
    let orgs: Vec<OrganizationMembership> = sqlx::query_as(
        r#"
        SELECT o.id, o.name, o.slug, ou.role
        FROM organizations o
        JOIN organization_user ou ON ou.organization_id = o.id
        WHERE ou.user_id = $1
        ORDER BY o.name
        "#,
    )
    .bind(auth_user.user_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(orgs))
}

pub async fn get_organization(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<Organization>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;

    let org: Option<Organization> = sqlx::query_as(&format!(
        "SELECT {} FROM organizations WHERE id = $1",
        ORGANIZATION_COLUMNS
    ))
    .bind(org_id)
    .fetch_optional(&state.pool)
    .await?;

    Ok(Json(found(org, "Organization")?))
}

pub async fn update_organization(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<UpdateOrganizationRequest>,
) -> ApiResult<Json<Organization>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "organization.update")
        .await?;

    if let Some(name) = req.name.as_deref() {
        validate_name(name)?;
    }
    if let Some(email) = req.billing_email.as_deref() {
        validate_email(email)?;
    }

    let mut tx = state.pool.begin().await?;

    let org: Option<Organization> = sqlx::query_as(&format!(
        r#"
        UPDATE organizations
        SET name = COALESCE($2, name),
            billing_email = COALESCE($3, billing_email),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        ORGANIZATION_COLUMNS
    ))
    .bind(org_id)
    .bind(req.name.as_deref().map(str::trim))
    .bind(&req.billing_email)
    .fetch_optional(&mut *tx)
    .await?;
    let org = found(org, "Organization")?;

    record_in(
        &mut *tx,
        AuditEntry::new(action::ORGANIZATION_UPDATED, target_type::ORGANIZATION)
            .organization(org_id)
            .actor(&auth_user)
            .target(org_id)
            .details(json!({
                "name": req.name,
                "billing_email_changed": req.billing_email.is_some(),
            })),
    )
    .await?;

    tx.commit().await?;
    Ok(Json(org))
}

pub async fn delete_organization(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "organization.delete")
        .await?;

    // Deleting the row would orphan a live Stripe subscription
    let open: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT stripe_subscription_id FROM subscriptions
        WHERE organization_id = $1 AND status <> 'canceled'
        LIMIT 1
        "#,
    )
    .bind(org_id)
    .fetch_optional(&state.pool)
    .await?;
    if open.is_some() {
        return Err(ApiError::Conflict(
            "Cancel the subscription before deleting the organization".to_string(),
        ));
    }

    let mut tx = state.pool.begin().await?;

    // Written first; the delete nulls organization_id but the row stays
    record_in(
        &mut *tx,
        AuditEntry::new(action::ORGANIZATION_DELETED, target_type::ORGANIZATION)
            .organization(org_id)
            .actor(&auth_user)
            .target(org_id),
    )
    .await?;

    let result = sqlx::query("DELETE FROM organizations WHERE id = $1")
        .bind(org_id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound("Organization".to_string()));
    }

    tx.commit().await?;
    state.authz.invalidate_organization(org_id).await;

    tracing::info!(org_id = %org_id, user_id = %auth_user.user_id, "Organization deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Acme Corp"), "acme-corp");
        assert_eq!(slugify("  Hello,   World!  "), "hello-world");
        assert_eq!(slugify("Ünïcode Ltd"), "n-code-ltd");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn test_slugify_truncates_cleanly() {
        let slug = slugify(&format!("{} tail", "a".repeat(62)));
        assert!(slug.len() <= 63);
        assert!(!slug.ends_with('-'));
        assert!(is_valid_slug(&slug));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("Acme").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_email_validation() {
        assert!(validate_email("billing@acme.io").is_ok());
        assert!(validate_email("billing@localhost").is_err());
        assert!(validate_email("@acme.io").is_err());
        assert!(validate_email("acme.io").is_err());
    }
}
