//! Domain enums persisted as TEXT columns

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Local subscription status, mirrored from Stripe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    Paused,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Whether the organization currently gets the plan's features
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active
        )
    }

    /// Statuses that still have a live subscription in Stripe
    pub fn is_open(&self) -> bool {
        !matches!(self, SubscriptionStatus::Canceled)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "paused" => Ok(SubscriptionStatus::Paused),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(UnknownVariant::new("subscription status", other)),
        }
    }
}

/// How a plan's price is computed from the subscription quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingModel {
    /// One fixed amount per interval
    Flat,
    /// `amount_cents` per seat
    PerSeat,
    /// Graduated tiers, each unit priced by the tier it falls in
    Tiered,
    /// All units priced by the tier the total quantity falls in
    Volume,
}

impl PricingModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingModel::Flat => "flat",
            PricingModel::PerSeat => "per_seat",
            PricingModel::Tiered => "tiered",
            PricingModel::Volume => "volume",
        }
    }

    pub fn uses_tiers(&self) -> bool {
        matches!(self, PricingModel::Tiered | PricingModel::Volume)
    }

    /// Whether the subscription quantity is meaningful for this model
    pub fn is_quantity_based(&self) -> bool {
        !matches!(self, PricingModel::Flat)
    }
}

impl fmt::Display for PricingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PricingModel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat" => Ok(PricingModel::Flat),
            "per_seat" => Ok(PricingModel::PerSeat),
            "tiered" => Ok(PricingModel::Tiered),
            "volume" => Ok(PricingModel::Volume),
            other => Err(UnknownVariant::new("pricing model", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "month" | "monthly" => Ok(BillingInterval::Month),
            "year" | "annual" | "yearly" => Ok(BillingInterval::Year),
            other => Err(UnknownVariant::new("billing interval", other)),
        }
    }
}

/// Platform-wide role used by the admin surface (not tenant roles)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformRole {
    User,
    Staff,
    Admin,
}

impl PlatformRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformRole::User => "user",
            PlatformRole::Staff => "staff",
            PlatformRole::Admin => "admin",
        }
    }

    /// Staff can read the admin surface but not write to it
    pub fn can_access_admin(&self, require_write: bool) -> bool {
        match self {
            PlatformRole::Admin => true,
            PlatformRole::Staff => !require_write,
            PlatformRole::User => false,
        }
    }
}

impl FromStr for PlatformRole {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(PlatformRole::User),
            "staff" => Ok(PlatformRole::Staff),
            "admin" | "superadmin" => Ok(PlatformRole::Admin),
            other => Err(UnknownVariant::new("platform role", other)),
        }
    }
}

/// A TEXT column held a value that no enum variant matches
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_status_round_trips_through_text() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::Paused,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = "incomplete".parse::<SubscriptionStatus>().unwrap_err();
        assert_eq!(err.kind, "subscription status");
        assert_eq!(err.to_string(), "unknown subscription status: incomplete");
    }

    #[test]
    fn test_entitlement_by_status() {
        assert!(SubscriptionStatus::Trialing.is_entitled());
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(!SubscriptionStatus::Paused.is_entitled());
        assert!(!SubscriptionStatus::PastDue.is_entitled());
        assert!(!SubscriptionStatus::Canceled.is_entitled());
        assert!(SubscriptionStatus::PastDue.is_open());
        assert!(!SubscriptionStatus::Canceled.is_open());
    }

    #[test]
    fn test_pricing_model_flags() {
        assert!(!PricingModel::Flat.uses_tiers());
        assert!(!PricingModel::PerSeat.uses_tiers());
        assert!(PricingModel::Tiered.uses_tiers());
        assert!(PricingModel::Volume.uses_tiers());
        assert!(!PricingModel::Flat.is_quantity_based());
        assert!(PricingModel::PerSeat.is_quantity_based());
        assert_eq!("per_seat".parse::<PricingModel>(), Ok(PricingModel::PerSeat));
    }

    #[test]
    fn test_billing_interval_aliases() {
        assert_eq!("monthly".parse::<BillingInterval>(), Ok(BillingInterval::Month));
        assert_eq!("annual".parse::<BillingInterval>(), Ok(BillingInterval::Year));
        assert!("weekly".parse::<BillingInterval>().is_err());
    }

    #[test]
    fn test_platform_role_admin_access() {
        assert!(PlatformRole::Admin.can_access_admin(true));
        assert!(PlatformRole::Staff.can_access_admin(false));
        assert!(!PlatformRole::Staff.can_access_admin(true));
        assert!(!PlatformRole::User.can_access_admin(false));
        assert_eq!("superadmin".parse::<PlatformRole>(), Ok(PlatformRole::Admin));
    }
}
