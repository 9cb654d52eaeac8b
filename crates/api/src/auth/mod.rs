//! Authentication for the Tenantdesk API

pub mod jwt;
pub mod middleware;

#[cfg(test)]
mod edge_case_tests;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{
    extract_ip_address, rate_limit_by_ip, require_auth, AuthError, AuthState, AuthUser,
};
