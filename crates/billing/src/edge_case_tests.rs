// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Boundary conditions across the subscription lifecycle:
//! - Webhook signatures at the tolerance edge
//! - Replayed and out-of-order status changes
//! - Cancellation and grace-period boundaries
//! - Plan tier limits

#[cfg(test)]
mod webhook_signature_tests {
    use crate::webhooks::verify_signature;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    // =========================================================================
    // Empty body is still signed content
    // =========================================================================
    #[test]
    fn test_empty_payload_signature() {
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign("", now, "whsec_x"));
        assert!(verify_signature("", &header, "whsec_x", 300, now).is_ok());
        assert!(verify_signature(" ", &header, "whsec_x", 300, now).is_err());
    }

    // =========================================================================
    // Whitespace around header parts is tolerated
    // =========================================================================
    #[test]
    fn test_header_whitespace() {
        let now = 1_700_000_000;
        let header = format!("t={}, v1={}", now, sign("{}", now, "whsec_x"));
        assert!(verify_signature("{}", &header, "whsec_x", 300, now).is_ok());
    }

    // =========================================================================
    // Zero tolerance accepts only the exact second
    // =========================================================================
    #[test]
    fn test_zero_tolerance() {
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign("{}", now, "whsec_x"));
        assert!(verify_signature("{}", &header, "whsec_x", 0, now).is_ok());
        assert!(verify_signature("{}", &header, "whsec_x", 0, now + 1).is_err());
    }

    // =========================================================================
    // Signature computed over the secret with its whsec_ prefix
    // =========================================================================
    #[test]
    fn test_prefix_is_part_of_key() {
        let now = 1_700_000_000;
        let stripped = format!("t={},v1={}", now, sign("{}", now, "x"));
        assert!(verify_signature("{}", &stripped, "whsec_x", 300, now).is_err());
    }
}

#[cfg(test)]
mod lifecycle_edge_tests {
    use crate::lifecycle::*;
    use tenantdesk_shared::SubscriptionStatus;
    use time::{Duration, OffsetDateTime};

    fn snapshot(status: SubscriptionStatus) -> SubscriptionSnapshot {
        let now = OffsetDateTime::now_utc();
        SubscriptionSnapshot {
            stripe_subscription_id: "sub_edge".to_string(),
            stripe_customer_id: "cus_edge".to_string(),
            status,
            stripe_price_id: Some("price_edge".to_string()),
            stripe_item_id: Some("si_edge".to_string()),
            quantity: 1,
            trial_ends_at: Some(now + Duration::days(7)),
            current_period_start: Some(now),
            current_period_end: Some(now + Duration::days(30)),
            cancel_at_period_end: false,
            canceled_at: None,
            ended_at: None,
            organization_id: None,
            plan_id: None,
        }
    }

    // =========================================================================
    // Replaying the same webhook twice classifies the second as Unchanged
    // =========================================================================
    #[test]
    fn test_replayed_update_is_unchanged() {
        let now = OffsetDateTime::now_utc();
        let snap = snapshot(SubscriptionStatus::Active);
        let first = LifecycleFields::derive(&snap, PriorState::default(), now);
        assert_eq!(first.transition, Transition::Started);

        let second = LifecycleFields::derive(
            &snap,
            PriorState {
                status: Some(first.status),
                canceled_at: first.canceled_at,
                paused_at: first.paused_at,
            },
            now,
        );
        assert_eq!(second.transition, Transition::Unchanged);
        assert_eq!(second.canceled_at, first.canceled_at);
    }

    // =========================================================================
    // Late "updated" after "deleted": last webhook wins
    // =========================================================================
    #[test]
    fn test_out_of_order_update_after_delete() {
        let now = OffsetDateTime::now_utc();
        let stale = snapshot(SubscriptionStatus::Active);
        let fields = LifecycleFields::derive(
            &stale,
            PriorState {
                status: Some(SubscriptionStatus::Canceled),
                canceled_at: Some(now),
                paused_at: None,
            },
            now,
        );
        assert_eq!(fields.status, SubscriptionStatus::Active);
        assert_eq!(fields.transition, Transition::Started);
    }

    // =========================================================================
    // Grace period ends exactly at ends_at
    // =========================================================================
    #[test]
    fn test_grace_period_boundary() {
        let ends = OffsetDateTime::now_utc();
        assert!(on_grace_period(
            SubscriptionStatus::Active,
            true,
            Some(ends),
            ends - Duration::seconds(1)
        ));
        assert!(!on_grace_period(SubscriptionStatus::Active, true, Some(ends), ends));
    }

    // =========================================================================
    // Scheduled cancel during a trial keeps trialing
    // =========================================================================
    #[test]
    fn test_cancel_during_trial() {
        let now = OffsetDateTime::now_utc();
        let mut snap = snapshot(SubscriptionStatus::Trialing);
        snap.cancel_at_period_end = true;
        let fields = LifecycleFields::derive(
            &snap,
            PriorState {
                status: Some(SubscriptionStatus::Trialing),
                ..Default::default()
            },
            now,
        );
        assert_eq!(fields.status, SubscriptionStatus::Trialing);
        assert!(fields.canceled_at.is_some());
    }

    // =========================================================================
    // Past-due subscription paused by collection suspension
    // =========================================================================
    #[test]
    fn test_past_due_to_paused() {
        assert_eq!(
            Transition::classify(Some(SubscriptionStatus::PastDue), SubscriptionStatus::Paused),
            Transition::Paused
        );
    }
}

#[cfg(test)]
mod plan_edge_tests {
    use crate::plans::{validate_tiers, PlanTier};

    fn tier(up_to: Option<i64>) -> PlanTier {
        PlanTier {
            up_to,
            unit_amount_cents: 100,
            flat_amount_cents: 0,
        }
    }

    // =========================================================================
    // Single unbounded tier is the minimal valid schedule
    // =========================================================================
    #[test]
    fn test_single_unbounded_tier() {
        assert!(validate_tiers(&[tier(None)]).is_ok());
    }

    // =========================================================================
    // Consecutive bounds one apart are still strictly increasing
    // =========================================================================
    #[test]
    fn test_adjacent_bounds() {
        assert!(validate_tiers(&[tier(Some(1)), tier(Some(2)), tier(None)]).is_ok());
    }

    // =========================================================================
    // Negative first bound rejected
    // =========================================================================
    #[test]
    fn test_negative_bound() {
        assert!(validate_tiers(&[tier(Some(-5)), tier(None)]).is_err());
    }

    // =========================================================================
    // Free tiers are allowed
    // =========================================================================
    #[test]
    fn test_zero_amount_tier() {
        let free = PlanTier {
            up_to: Some(3),
            unit_amount_cents: 0,
            flat_amount_cents: 0,
        };
        assert!(validate_tiers(&[free, tier(None)]).is_ok());
    }
}
