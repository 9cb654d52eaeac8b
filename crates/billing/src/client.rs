//! Stripe client and configuration

use std::fmt;
use std::sync::Arc;

use crate::error::{BillingError, BillingResult};

/// Default webhook timestamp tolerance (5 minutes)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    /// Load from `STRIPE_*` environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        if secret_key.trim().is_empty() {
            return Err(BillingError::Config(
                "STRIPE_SECRET_KEY is empty".to_string(),
            ));
        }

        let checkout_success_url = std::env::var("STRIPE_CHECKOUT_SUCCESS_URL")
            .unwrap_or_else(|_| "http://localhost:3000/billing?checkout=success".to_string());
        let checkout_cancel_url = std::env::var("STRIPE_CHECKOUT_CANCEL_URL")
            .unwrap_or_else(|_| "http://localhost:3000/billing?checkout=canceled".to_string());

        let webhook_tolerance_secs = match std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                BillingError::Config(format!("STRIPE_WEBHOOK_TOLERANCE_SECS is not a number: {raw}"))
            })?,
            Err(_) => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        Ok(Self {
            secret_key,
            webhook_secret,
            checkout_success_url,
            checkout_cancel_url,
            webhook_tolerance_secs,
        })
    }

    pub fn is_test_mode(&self) -> bool {
        self.secret_key.starts_with("sk_test_")
    }
}

// Keys stay out of logs
impl fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .field("checkout_success_url", &self.checkout_success_url)
            .field("checkout_cancel_url", &self.checkout_cancel_url)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .finish()
    }
}

/// Cheap-to-clone handle on the Stripe API client plus its config
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        tracing::info!(test_mode = config.is_test_mode(), "Stripe client configured");
        Ok(Self::new(config))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "STRIPE_SECRET_KEY",
            "STRIPE_WEBHOOK_SECRET",
            "STRIPE_CHECKOUT_SUCCESS_URL",
            "STRIPE_CHECKOUT_CANCEL_URL",
            "STRIPE_WEBHOOK_TOLERANCE_SECS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_requires_secret_key() {
        clear_env();
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test");
        let err = StripeConfig::from_env().unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test");

        let config = StripeConfig::from_env().unwrap();
        assert!(config.is_test_mode());
        assert_eq!(config.webhook_tolerance_secs, DEFAULT_WEBHOOK_TOLERANCE_SECS);
        assert!(config.checkout_success_url.contains("checkout=success"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_tolerance() {
        clear_env();
        std::env::set_var("STRIPE_SECRET_KEY", "sk_live_123");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test");
        std::env::set_var("STRIPE_WEBHOOK_TOLERANCE_SECS", "five minutes");

        assert!(StripeConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_debug_redacts_keys() {
        let config = StripeConfig {
            secret_key: "sk_live_secret".to_string(),
            webhook_secret: "whsec_secret".to_string(),
            checkout_success_url: "https://app/ok".to_string(),
            checkout_cancel_url: "https://app/cancel".to_string(),
            webhook_tolerance_secs: 300,
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk_live_secret"));
        assert!(!debug.contains("whsec_secret"));
        assert!(!config.is_test_mode());
    }
}
