//! Subscription lifecycle state machine
//!
//! Pure functions that turn a Stripe subscription into the local row and
//! classify what changed. Nothing here touches the database or Stripe, so the
//! whole lifecycle is unit-testable.

use serde::Serialize;
use stripe::{Subscription, SubscriptionStatus as StripeSubStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use tenantdesk_shared::SubscriptionStatus;

use crate::events::BillingEventType;

/// Map a Stripe status onto the five local statuses.
///
/// `pause_collection` wins over whatever Stripe reports, because Stripe keeps
/// such subscriptions `active` while collection is suspended.
pub fn map_stripe_status(status: &StripeSubStatus, collection_paused: bool) -> SubscriptionStatus {
    if collection_paused && !matches!(status, StripeSubStatus::Canceled) {
        return SubscriptionStatus::Paused;
    }

    match status {
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
        StripeSubStatus::PastDue | StripeSubStatus::Unpaid | StripeSubStatus::Incomplete => {
            SubscriptionStatus::PastDue
        }
        StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => {
            SubscriptionStatus::Canceled
        }
    }
}

/// What a status change means for the organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Started,
    Activated,
    Paused,
    Resumed,
    PaymentFailed,
    Recovered,
    Canceled,
    Unchanged,
}

impl Transition {
    pub fn classify(previous: Option<SubscriptionStatus>, next: SubscriptionStatus) -> Self {
        use SubscriptionStatus as S;

        let Some(previous) = previous else {
            return match next {
                S::Canceled => Transition::Canceled,
                _ => Transition::Started,
            };
        };

        if previous == next {
            return Transition::Unchanged;
        }

        match (previous, next) {
            (_, S::Canceled) => Transition::Canceled,
            (_, S::PastDue) => Transition::PaymentFailed,
            (_, S::Paused) => Transition::Paused,
            (S::Canceled, _) => Transition::Started,
            (S::PastDue, _) => Transition::Recovered,
            (S::Paused, _) => Transition::Resumed,
            (S::Active, S::Trialing) => Transition::Started,
            (_, _) => Transition::Activated,
        }
    }

    /// Billing timeline entry for this transition, if it is worth recording
    pub fn event_type(&self) -> Option<BillingEventType> {
        match self {
            Transition::Started => Some(BillingEventType::SubscriptionStarted),
            Transition::Activated => Some(BillingEventType::SubscriptionActivated),
            Transition::Paused => Some(BillingEventType::SubscriptionPaused),
            Transition::Resumed => Some(BillingEventType::SubscriptionResumed),
            Transition::PaymentFailed => Some(BillingEventType::PaymentFailed),
            Transition::Recovered => Some(BillingEventType::PaymentRecovered),
            Transition::Canceled => Some(BillingEventType::SubscriptionCanceled),
            Transition::Unchanged => None,
        }
    }
}

/// The parts of a Stripe subscription the local row mirrors
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub status: SubscriptionStatus,
    pub stripe_price_id: Option<String>,
    pub stripe_item_id: Option<String>,
    pub quantity: i64,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    /// `org_id` metadata stamped at checkout
    pub organization_id: Option<Uuid>,
    /// `plan_id` metadata stamped at checkout or migration
    pub plan_id: Option<Uuid>,
}

fn timestamp(ts: i64) -> Option<OffsetDateTime> {
    if ts <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

impl SubscriptionSnapshot {
    pub fn from_stripe(subscription: &Subscription) -> Self {
        let stripe_customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        };

        let item = subscription.items.data.first();

        let metadata_uuid =
            |key: &str| subscription.metadata.get(key).and_then(|v| Uuid::parse_str(v).ok());

        Self {
            stripe_subscription_id: subscription.id.to_string(),
            stripe_customer_id,
            status: map_stripe_status(
                &subscription.status,
                subscription.pause_collection.is_some(),
            ),
            stripe_price_id: item
                .and_then(|item| item.price.as_ref())
                .map(|price| price.id.to_string()),
            stripe_item_id: item.map(|item| item.id.to_string()),
            quantity: item
                .and_then(|item| item.quantity)
                .map(|q| q as i64)
                .unwrap_or(1),
            trial_ends_at: subscription.trial_end.and_then(timestamp),
            current_period_start: timestamp(subscription.current_period_start),
            current_period_end: timestamp(subscription.current_period_end),
            cancel_at_period_end: subscription.cancel_at_period_end,
            canceled_at: subscription.canceled_at.and_then(timestamp),
            ended_at: subscription.ended_at.and_then(timestamp),
            organization_id: metadata_uuid("org_id"),
            plan_id: metadata_uuid("plan_id"),
        }
    }
}

/// Local fields carried across syncs
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriorState {
    pub status: Option<SubscriptionStatus>,
    pub canceled_at: Option<OffsetDateTime>,
    pub paused_at: Option<OffsetDateTime>,
}

/// Lifecycle columns computed from a snapshot and the previous row
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleFields {
    pub status: SubscriptionStatus,
    pub canceled_at: Option<OffsetDateTime>,
    pub ends_at: Option<OffsetDateTime>,
    pub paused_at: Option<OffsetDateTime>,
    pub transition: Transition,
}

impl LifecycleFields {
    /// Reconcile lifecycle columns.
    ///
    /// A scheduled cancellation keeps the status Stripe reports and only stamps
    /// `canceled_at`/`ends_at`; the status flips to canceled once Stripe says so.
    pub fn derive(snapshot: &SubscriptionSnapshot, prior: PriorState, now: OffsetDateTime) -> Self {
        let status = snapshot.status;

        let canceled_at = if status == SubscriptionStatus::Canceled || snapshot.cancel_at_period_end
        {
            snapshot.canceled_at.or(prior.canceled_at).or(Some(now))
        } else {
            // Resumed from grace period
            None
        };

        let ends_at = if status == SubscriptionStatus::Canceled {
            snapshot
                .ended_at
                .or(snapshot.current_period_end.filter(|end| *end <= now))
                .or(Some(now))
        } else if snapshot.cancel_at_period_end {
            snapshot.current_period_end
        } else {
            None
        };

        let paused_at = if status == SubscriptionStatus::Paused {
            prior.paused_at.or(Some(now))
        } else {
            None
        };

        Self {
            status,
            canceled_at,
            ends_at,
            paused_at,
            transition: Transition::classify(prior.status, status),
        }
    }
}

/// Whether a scheduled cancellation can still be undone
pub fn on_grace_period(
    status: SubscriptionStatus,
    cancel_at_period_end: bool,
    ends_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> bool {
    status != SubscriptionStatus::Canceled
        && cancel_at_period_end
        && ends_at.map(|end| end > now).unwrap_or(false)
}

/// Migration only calls Stripe when the target price differs
pub fn price_change_required(current_price_id: Option<&str>, target_price_id: &str) -> bool {
    current_price_id != Some(target_price_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn snapshot(status: SubscriptionStatus) -> SubscriptionSnapshot {
        let now = OffsetDateTime::now_utc();
        SubscriptionSnapshot {
            stripe_subscription_id: "sub_123".to_string(),
            stripe_customer_id: "cus_123".to_string(),
            status,
            stripe_price_id: Some("price_a".to_string()),
            stripe_item_id: Some("si_1".to_string()),
            quantity: 1,
            trial_ends_at: None,
            current_period_start: Some(now - Duration::days(20)),
            current_period_end: Some(now + Duration::days(10)),
            cancel_at_period_end: false,
            canceled_at: None,
            ended_at: None,
            organization_id: Some(Uuid::new_v4()),
            plan_id: None,
        }
    }

    // ========================================================================
    // Status mapping
    // ========================================================================

    #[test]
    fn test_direct_status_mapping() {
        assert_eq!(map_stripe_status(&StripeSubStatus::Trialing, false), SubscriptionStatus::Trialing);
        assert_eq!(map_stripe_status(&StripeSubStatus::Active, false), SubscriptionStatus::Active);
        assert_eq!(map_stripe_status(&StripeSubStatus::PastDue, false), SubscriptionStatus::PastDue);
        assert_eq!(map_stripe_status(&StripeSubStatus::Canceled, false), SubscriptionStatus::Canceled);
        assert_eq!(map_stripe_status(&StripeSubStatus::Paused, false), SubscriptionStatus::Paused);
    }

    #[test]
    fn test_folded_status_mapping() {
        assert_eq!(map_stripe_status(&StripeSubStatus::Unpaid, false), SubscriptionStatus::PastDue);
        assert_eq!(map_stripe_status(&StripeSubStatus::Incomplete, false), SubscriptionStatus::PastDue);
        assert_eq!(
            map_stripe_status(&StripeSubStatus::IncompleteExpired, false),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_pause_collection_overrides_active() {
        assert_eq!(map_stripe_status(&StripeSubStatus::Active, true), SubscriptionStatus::Paused);
        assert_eq!(map_stripe_status(&StripeSubStatus::Trialing, true), SubscriptionStatus::Paused);
        // Canceled is terminal even if pause_collection lingers
        assert_eq!(map_stripe_status(&StripeSubStatus::Canceled, true), SubscriptionStatus::Canceled);
    }

    // ========================================================================
    // Transition classification
    // ========================================================================

    #[test]
    fn test_first_sync_starts_subscription() {
        use SubscriptionStatus as S;
        assert_eq!(Transition::classify(None, S::Trialing), Transition::Started);
        assert_eq!(Transition::classify(None, S::Active), Transition::Started);
        assert_eq!(Transition::classify(None, S::Canceled), Transition::Canceled);
    }

    #[test]
    fn test_lifecycle_transitions() {
        use SubscriptionStatus as S;
        assert_eq!(Transition::classify(Some(S::Trialing), S::Active), Transition::Activated);
        assert_eq!(Transition::classify(Some(S::Active), S::PastDue), Transition::PaymentFailed);
        assert_eq!(Transition::classify(Some(S::PastDue), S::Active), Transition::Recovered);
        assert_eq!(Transition::classify(Some(S::Active), S::Paused), Transition::Paused);
        assert_eq!(Transition::classify(Some(S::Paused), S::Active), Transition::Resumed);
        assert_eq!(Transition::classify(Some(S::PastDue), S::Canceled), Transition::Canceled);
        assert_eq!(Transition::classify(Some(S::Canceled), S::Active), Transition::Started);
        assert_eq!(Transition::classify(Some(S::Active), S::Active), Transition::Unchanged);
    }

    #[test]
    fn test_unchanged_has_no_billing_event() {
        assert!(Transition::Unchanged.event_type().is_none());
        assert_eq!(
            Transition::PaymentFailed.event_type(),
            Some(BillingEventType::PaymentFailed)
        );
    }

    // ========================================================================
    // Lifecycle fields
    // ========================================================================

    #[test]
    fn test_scheduled_cancel_keeps_status_and_sets_canceled_at() {
        let now = OffsetDateTime::now_utc();
        let mut snap = snapshot(SubscriptionStatus::Active);
        snap.cancel_at_period_end = true;

        let prior = PriorState {
            status: Some(SubscriptionStatus::Active),
            ..Default::default()
        };
        let fields = LifecycleFields::derive(&snap, prior, now);

        assert_eq!(fields.status, SubscriptionStatus::Active);
        assert_eq!(fields.canceled_at, Some(now));
        assert_eq!(fields.ends_at, snap.current_period_end);
        assert_eq!(fields.transition, Transition::Unchanged);
    }

    #[test]
    fn test_scheduled_cancel_keeps_first_canceled_at() {
        let now = OffsetDateTime::now_utc();
        let earlier = now - Duration::days(3);
        let mut snap = snapshot(SubscriptionStatus::Active);
        snap.cancel_at_period_end = true;

        let prior = PriorState {
            status: Some(SubscriptionStatus::Active),
            canceled_at: Some(earlier),
            paused_at: None,
        };
        let fields = LifecycleFields::derive(&snap, prior, now);
        assert_eq!(fields.canceled_at, Some(earlier));
    }

    #[test]
    fn test_resume_clears_cancellation() {
        let now = OffsetDateTime::now_utc();
        let snap = snapshot(SubscriptionStatus::Active);
        let prior = PriorState {
            status: Some(SubscriptionStatus::Active),
            canceled_at: Some(now - Duration::days(1)),
            paused_at: None,
        };
        let fields = LifecycleFields::derive(&snap, prior, now);
        assert_eq!(fields.canceled_at, None);
        assert_eq!(fields.ends_at, None);
    }

    #[test]
    fn test_deleted_subscription_sets_ends_at() {
        let now = OffsetDateTime::now_utc();
        let ended = now - Duration::minutes(5);
        let mut snap = snapshot(SubscriptionStatus::Canceled);
        snap.ended_at = Some(ended);
        snap.canceled_at = Some(ended);

        let prior = PriorState {
            status: Some(SubscriptionStatus::Active),
            ..Default::default()
        };
        let fields = LifecycleFields::derive(&snap, prior, now);
        assert_eq!(fields.status, SubscriptionStatus::Canceled);
        assert_eq!(fields.ends_at, Some(ended));
        assert_eq!(fields.canceled_at, Some(ended));
        assert_eq!(fields.transition, Transition::Canceled);
    }

    #[test]
    fn test_canceled_without_ended_at_falls_back_to_now() {
        let now = OffsetDateTime::now_utc();
        let snap = snapshot(SubscriptionStatus::Canceled);
        let fields = LifecycleFields::derive(&snap, PriorState::default(), now);
        assert_eq!(fields.ends_at, Some(now));
    }

    #[test]
    fn test_paused_at_is_stable_across_syncs() {
        let now = OffsetDateTime::now_utc();
        let paused_since = now - Duration::days(2);
        let snap = snapshot(SubscriptionStatus::Paused);

        let fields = LifecycleFields::derive(
            &snap,
            PriorState {
                status: Some(SubscriptionStatus::Paused),
                canceled_at: None,
                paused_at: Some(paused_since),
            },
            now,
        );
        assert_eq!(fields.paused_at, Some(paused_since));

        let unpaused = LifecycleFields::derive(
            &snapshot(SubscriptionStatus::Active),
            PriorState {
                status: Some(SubscriptionStatus::Paused),
                canceled_at: None,
                paused_at: Some(paused_since),
            },
            now,
        );
        assert_eq!(unpaused.paused_at, None);
        assert_eq!(unpaused.transition, Transition::Resumed);
    }

    // ========================================================================
    // Grace period and migration
    // ========================================================================

    #[test]
    fn test_grace_period() {
        let now = OffsetDateTime::now_utc();
        let future = Some(now + Duration::days(5));
        let past = Some(now - Duration::days(1));

        assert!(on_grace_period(SubscriptionStatus::Active, true, future, now));
        assert!(!on_grace_period(SubscriptionStatus::Active, false, future, now));
        assert!(!on_grace_period(SubscriptionStatus::Active, true, past, now));
        assert!(!on_grace_period(SubscriptionStatus::Canceled, true, future, now));
        assert!(!on_grace_period(SubscriptionStatus::Active, true, None, now));
    }

    #[test]
    fn test_price_change_required_only_when_price_differs() {
        assert!(!price_change_required(Some("price_a"), "price_a"));
        assert!(price_change_required(Some("price_a"), "price_b"));
        assert!(price_change_required(None, "price_a"));
    }
}
