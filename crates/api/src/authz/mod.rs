//! Permission resolution
//!
//! A user holds a permission in an organization when either a direct grant
//! (`user_permissions`) or a role grant (membership role -> `role_permissions`)
//! exists. Results, positive and negative, are cached per
//! `(user, organization, permission)` and tagged so that membership and role
//! changes can drop exactly the affected entries:
//!
//! | change | tag flushed |
//! |---|---|
//! | direct grant / revoke, membership added, removed or re-roled | `user:{user}` |
//! | permission change on an org-scoped role, role deleted | `org:{org}` |
//! | permission change on a global role | `authz` |
//!
//! The cache is an optimisation only. Any cache error falls back to evaluating
//! against the grant source directly.

mod grants;

pub use grants::PgGrantSource;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use tenantdesk_shared::TaggedCache;

use crate::error::{ApiError, ApiResult};

/// Tag carried by every cached decision
pub const GLOBAL_TAG: &str = "authz";

/// Where grants are looked up on a cache miss
#[async_trait]
pub trait GrantSource: Send + Sync {
    async fn has_direct_grant(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        permission: &str,
    ) -> Result<bool, sqlx::Error>;

    async fn has_role_grant(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        permission: &str,
    ) -> Result<bool, sqlx::Error>;
}

pub fn cache_key(user_id: Uuid, organization_id: Uuid, permission: &str) -> String {
    format!("authz:{}:{}:{}", user_id, organization_id, permission)
}

pub fn user_tag(user_id: Uuid) -> String {
    format!("user:{}", user_id)
}

pub fn org_tag(organization_id: Uuid) -> String {
    format!("org:{}", organization_id)
}

#[derive(Clone)]
pub struct AuthorizationService {
    cache: Arc<dyn TaggedCache>,
    grants: Arc<dyn GrantSource>,
    ttl: Duration,
}

impl AuthorizationService {
    pub fn new(cache: Arc<dyn TaggedCache>, grants: Arc<dyn GrantSource>, ttl: Duration) -> Self {
        Self { cache, grants, ttl }
    }

    pub fn backend(&self) -> &'static str {
        self.cache.backend()
    }

    /// Whether `user_id` holds `permission` in `organization_id`
    pub async fn check(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        permission: &str,
    ) -> ApiResult<bool> {
        let key = cache_key(user_id, organization_id, permission);

        match self.cache.get(&key).await {
            Ok(Some(value)) => match value.as_str() {
                "1" => return Ok(true),
                "0" => return Ok(false),
                other => {
                    tracing::warn!(key = %key, value = %other, "Unexpected cached permission value");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    backend = self.cache.backend(),
                    "Permission cache read failed, evaluating directly"
                );
                return self.evaluate(user_id, organization_id, permission).await;
            }
        }

        let allowed = self.evaluate(user_id, organization_id, permission).await?;

        let tags = [user_tag(user_id), org_tag(organization_id), GLOBAL_TAG.to_string()];
        let value = if allowed { "1" } else { "0" };
        if let Err(e) = self.cache.put(&key, value, self.ttl, &tags).await {
            tracing::warn!(error = %e, key = %key, "Failed to cache permission decision");
        }

        Ok(allowed)
    }

    /// Fail with `Forbidden` unless the user holds the permission
    pub async fn authorize(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        permission: &str,
    ) -> ApiResult<()> {
        if self.check(user_id, organization_id, permission).await? {
            Ok(())
        } else {
            tracing::info!(
                user_id = %user_id,
                organization_id = %organization_id,
                permission = %permission,
                "Permission denied"
            );
            Err(ApiError::Forbidden)
        }
    }

    /// Fail with `Forbidden` unless the actor already holds every permission
    /// being handed out, whether directly or through a role.
    pub async fn authorize_delegation(
        &self,
        actor_id: Uuid,
        organization_id: Uuid,
        permissions: &[String],
    ) -> ApiResult<()> {
        for permission in permissions {
            if !self.check(actor_id, organization_id, permission).await? {
                tracing::warn!(
                    actor_id = %actor_id,
                    organization_id = %organization_id,
                    permission = %permission,
                    "Refused to delegate a permission the actor does not hold"
                );
                return Err(ApiError::Forbidden);
            }
        }
        Ok(())
    }

    async fn evaluate(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        permission: &str,
    ) -> ApiResult<bool> {
        if self
            .grants
            .has_direct_grant(user_id, organization_id, permission)
            .await?
        {
            return Ok(true);
        }
        Ok(self
            .grants
            .has_role_grant(user_id, organization_id, permission)
            .await?)
    }

    pub async fn invalidate_user(&self, user_id: Uuid) {
        self.flush(user_tag(user_id)).await;
    }

    pub async fn invalidate_organization(&self, organization_id: Uuid) {
        self.flush(org_tag(organization_id)).await;
    }

    pub async fn invalidate_all(&self) {
        self.flush(GLOBAL_TAG.to_string()).await;
    }

    async fn flush(&self, tag: String) {
        match self.cache.flush_tags(std::slice::from_ref(&tag)).await {
            Ok(removed) => {
                tracing::debug!(tag = %tag, removed = removed, "Permission cache invalidated");
            }
            // Entries expire on their own; stale for at most one TTL
            Err(e) => tracing::error!(tag = %tag, error = %e, "Permission cache invalidation failed"),
        }
    }
}
