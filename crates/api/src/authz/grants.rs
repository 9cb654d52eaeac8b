//! Grant lookups against Postgres

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::GrantSource;

#[derive(Clone)]
pub struct PgGrantSource {
    pool: PgPool,
}

impl PgGrantSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GrantSource for PgGrantSource {
    async fn has_direct_grant(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        permission: &str,
    ) -> Result<bool, sqlx::Error> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM user_permissions up
                JOIN permissions p ON p.id = up.permission_id
                WHERE up.user_id = $1
                  AND up.organization_id = $2
                  AND p.slug = $3
            )
            "#,
        )
        .bind(user_id)
        .bind(organization_id)
        .bind(permission)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn has_role_grant(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        permission: &str,
    ) -> Result<bool, sqlx::Error> {
        // The membership role names a role by slug, global or owned by the same org
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM organization_user ou
                JOIN roles r
                  ON r.slug = ou.role
                 AND (r.organization_id IS NULL OR r.organization_id = ou.organization_id)
                JOIN role_permissions rp ON rp.role_id = r.id
                JOIN permissions p ON p.id = rp.permission_id
                WHERE ou.user_id = $1
                  AND ou.organization_id = $2
                  AND p.slug = $3
            )
            "#,
        )
        .bind(user_id)
        .bind(organization_id)
        .bind(permission)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}
