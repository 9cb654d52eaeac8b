// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps sqlx::Error
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Tenantdesk API Library
//!
//! HTTP surface for organizations, members, roles, permission grants,
//! subscriptions and the Stripe webhook endpoint.

pub mod audit;
pub mod auth;
pub mod authz;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use authz::AuthorizationService;
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
