//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use tenantdesk_shared::{RateLimiter, TaggedCache};

use crate::{
    audit::AuditLogger,
    auth::{AuthState, JwtManager},
    authz::{AuthorizationService, PgGrantSource},
    config::Config,
};

#[cfg(feature = "billing")]
use crate::error::{ApiError, ApiResult};

/// Access tokens are issued for a day
const JWT_EXPIRY_HOURS: i64 = 24;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub authz: AuthorizationService,
    pub audit: AuditLogger,
    pub rate_limiter: RateLimiter,
    /// Billing service (only available when billing feature is enabled)
    #[cfg(feature = "billing")]
    pub billing: Option<Arc<tenantdesk_billing::BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, cache: Arc<dyn TaggedCache>) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, JWT_EXPIRY_HOURS);

        tracing::info!(
            backend = cache.backend(),
            ttl_secs = config.permission_cache_ttl.as_secs(),
            "Permission cache initialized"
        );
        let authz = AuthorizationService::new(
            cache,
            Arc::new(PgGrantSource::new(pool.clone())),
            config.permission_cache_ttl,
        );

        let rate_limiter = RateLimiter::new_in_memory();
        tracing::info!(
            per_minute = config.rate_limit_per_minute,
            "Rate limiter initialized"
        );

        #[cfg(feature = "billing")]
        let billing = if config.enable_billing {
            match tenantdesk_billing::BillingService::from_env(pool.clone()) {
                Ok(service) => {
                    tracing::info!("Billing service initialized");
                    Some(Arc::new(service))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Billing service not initialized");
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled by configuration");
            None
        };

        Self {
            audit: AuditLogger::new(pool.clone()),
            pool,
            config,
            jwt_manager,
            authz,
            rate_limiter,
            #[cfg(feature = "billing")]
            billing,
        }
    }

    /// Swap in a configured billing service, used by tests and embedders
    #[cfg(feature = "billing")]
    pub fn with_billing(mut self, billing: tenantdesk_billing::BillingService) -> Self {
        self.billing = Some(Arc::new(billing));
        self
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            pool: self.pool.clone(),
            rate_limiter: self.rate_limiter.clone(),
            rate_limit_per_minute: self.config.rate_limit_per_minute,
        }
    }

    #[cfg(feature = "billing")]
    pub fn billing(&self) -> ApiResult<&tenantdesk_billing::BillingService> {
        self.billing.as_deref().ok_or(ApiError::BillingUnavailable)
    }
}
