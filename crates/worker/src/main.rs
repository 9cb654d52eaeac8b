//! Tenantdesk Background Worker
//!
//! Handles scheduled jobs:
//! - Subscription drift reconciliation against Stripe (every 15 minutes)
//! - Replay of failed webhook events (every 5 minutes)
//! - Billing invariant checks (hourly)
//! - Pruning of processed webhook events (daily at 03:30 UTC)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};

use tenantdesk_billing::{
    BillingResult, BillingService, SubscriptionService, ViolationSeverity, WebhookReplayResult,
};

/// Subscriptions reconciled per drift run
const DRIFT_BATCH_SIZE: i64 = 50;

/// Failed webhook events replayed per run
const REPLAY_BATCH_SIZE: i64 = 25;

/// Processed webhook events are kept this long for idempotency
const WEBHOOK_RETENTION_DAYS: i32 = 30;

async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Fetch each stale subscription from Stripe and write it back through the
/// normal sync path, so drift shows up as an ordinary transition.
async fn reconcile_drift(subscriptions: &SubscriptionService) -> BillingResult<(usize, usize)> {
    let stale = subscriptions
        .stale_open_subscriptions(DRIFT_BATCH_SIZE)
        .await?;

    let mut synced = 0;
    let mut changed = 0;
    for stripe_id in stale {
        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        let fetched = Retry::spawn(strategy, || subscriptions.fetch_from_stripe(&stripe_id)).await;

        let subscription = match fetched {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(stripe_subscription_id = %stripe_id, error = %e, "Failed to fetch subscription from Stripe");
                continue;
            }
        };

        match subscriptions.sync_from_stripe(&subscription).await {
            Ok(outcome) => {
                synced += 1;
                if outcome.transition.event_type().is_some() {
                    changed += 1;
                    warn!(
                        stripe_subscription_id = %stripe_id,
                        status = %outcome.subscription.status,
                        "Subscription drift corrected"
                    );
                }
                subscriptions.log_transition(&outcome, None, None).await;
            }
            Err(e) => {
                error!(stripe_subscription_id = %stripe_id, error = %e, "Failed to sync subscription");
            }
        }
    }

    Ok((synced, changed))
}

fn log_replay_results(results: &[WebhookReplayResult]) {
    let succeeded = results.iter().filter(|r| r.success).count();
    info!(
        replayed = results.len(),
        succeeded = succeeded,
        failed = results.len() - succeeded,
        "Webhook replay cycle complete"
    );

    for result in results.iter().filter(|r| !r.success) {
        warn!(
            stripe_event_id = %result.stripe_event_id,
            event_type = %result.event_type,
            error = ?result.new_error,
            "Webhook replay failed"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Tenantdesk Worker v{}", env!("CARGO_PKG_VERSION"));

    let pool = create_db_pool().await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Nothing to reconcile without Stripe
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Drift reconciliation
    let drift_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = drift_billing.clone();
            Box::pin(async move {
                info!("Running subscription drift reconciliation");
                match reconcile_drift(&billing.subscriptions).await {
                    Ok((synced, changed)) => {
                        info!(synced = synced, changed = changed, "Drift reconciliation complete")
                    }
                    Err(e) => error!(error = %e, "Drift reconciliation failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Subscription drift reconciliation (every 15 minutes)");

    // Job 2: Replay failed webhooks
    let replay_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = replay_billing.clone();
            Box::pin(async move {
                match billing
                    .webhooks
                    .replay_all_failed(Some(REPLAY_BATCH_SIZE))
                    .await
                {
                    Ok(results) if results.is_empty() => {}
                    Ok(results) => log_replay_results(&results),
                    Err(e) => error!(error = %e, "Webhook replay job failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failed webhook replay (every 5 minutes)");

    // Job 3: Billing invariants
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                let summary = match billing.invariants.run_all_checks().await {
                    Ok(summary) => summary,
                    Err(e) => {
                        error!(error = %e, "Invariant check run failed");
                        return;
                    }
                };

                match summary.worst_severity() {
                    None => info!(checks_run = summary.checks_run, "Billing invariants healthy"),
                    Some(ViolationSeverity::Critical | ViolationSeverity::High) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                affected = violation.org_ids.len(),
                                "{}",
                                violation.description
                            );
                        }
                    }
                    Some(_) => {
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                affected = violation.org_ids.len(),
                                "{}",
                                violation.description
                            );
                        }
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (hourly)");

    // Job 4: Prune processed webhook events
    let prune_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let billing = prune_billing.clone();
            Box::pin(async move {
                match billing.webhooks.prune_processed(WEBHOOK_RETENTION_DAYS).await {
                    Ok(deleted) => info!(deleted = deleted, "Pruned processed webhook events"),
                    Err(e) => error!(error = %e, "Webhook prune failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event pruning (daily at 03:30 UTC)");

    // Job 5: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Worker started, waiting for jobs...");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");

    Ok(())
}
