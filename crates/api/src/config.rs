//! Server configuration
//!
//! Loaded once at startup from environment variables (a `.env` file is read by
//! `main` through dotenvy first).
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/tenantdesk   # required
//! JWT_SECRET=...                                 # required, 32+ bytes
//! BIND_ADDRESS=0.0.0.0:8080
//! REDIS_URL=redis://localhost:6379               # optional, in-memory cache when unset
//! PERMISSION_CACHE_TTL_SECS=600
//! ENABLE_BILLING=true
//! ALLOWED_ORIGINS=http://localhost:3000,http://127.0.0.1:3000
//! RATE_LIMIT_PER_MINUTE=120
//! RUN_MIGRATIONS=false
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_PERMISSION_CACHE_TTL_SECS: u64 = 600;
const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 120;
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";
const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} bytes")]
    WeakJwtSecret,
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub jwt_secret: String,
    pub redis_url: Option<String>,
    pub permission_cache_ttl: Duration,
    pub enable_billing: bool,
    pub allowed_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
    pub run_migrations: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("jwt_secret", &"[REDACTED]")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[SET]"))
            .field("permission_cache_ttl", &self.permission_cache_ttl)
            .field("enable_billing", &self.enable_billing)
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL"))?;

        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| ConfigError::MissingEnvVar("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::WeakJwtSecret);
        }

        let bind_address =
            env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let redis_url = env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty());

        let ttl_secs = parse_var("PERMISSION_CACHE_TTL_SECS", DEFAULT_PERMISSION_CACHE_TTL_SECS)?;
        let rate_limit_per_minute =
            parse_var("RATE_LIMIT_PER_MINUTE", DEFAULT_RATE_LIMIT_PER_MINUTE)?;
        if rate_limit_per_minute == 0 {
            return Err(ConfigError::InvalidValue {
                name: "RATE_LIMIT_PER_MINUTE",
                value: "0".to_string(),
            });
        }

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            bind_address,
            jwt_secret,
            redis_url,
            permission_cache_ttl: Duration::from_secs(ttl_secs),
            enable_billing: parse_bool("ENABLE_BILLING", true),
            allowed_origins,
            rate_limit_per_minute,
            run_migrations: parse_bool("RUN_MIGRATIONS", false),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}
