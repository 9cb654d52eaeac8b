#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tenantdesk shared crate
//!
//! Pieces used by both the API server and the background worker:
//! database pool setup and migrations, the tagged cache used by the
//! permission engine, the in-memory rate limiter and the domain enums
//! that are persisted as text columns.

pub mod cache;
pub mod db;
pub mod rate_limit;
pub mod types;

pub use cache::{CacheError, CacheResult, MemoryCache, RedisCache, TaggedCache};
pub use db::{create_pool, run_migrations};
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use types::{BillingInterval, PlatformRole, PricingModel, SubscriptionStatus};
