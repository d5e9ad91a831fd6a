//! Clinicore Background Worker
//!
//! Handles scheduled billing jobs:
//! - Failed webhook event retries, within the attempt cap (every minute)
//! - Operator queue surfacing: permanently failed events and tenants
//!   flagged for forced downgrade (every 15 minutes)
//! - Trial expiry sweep (hourly)
//! - Billing invariant checks (daily at 3:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use clinicore_billing::BillingService;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Clinicore Worker");

    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = clinicore_billing::create_pool(&database_url).await?;

    let billing = Arc::new(BillingService::from_env(pool.clone()));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Retry failed webhook events (every minute)
    // Events beyond the attempt cap are left for the operator queue job.
    let retry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = retry_billing.clone();
            Box::pin(async move {
                match billing.webhooks.retry_failed_events(50).await {
                    Ok(0) => {}
                    Ok(recovered) => {
                        info!(recovered = recovered, "Webhook retry cycle complete");
                    }
                    Err(e) => error!(error = %e, "Webhook retry cycle failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event retries (every minute)");

    // Job 2: Operator queue surfacing (every 15 minutes)
    // Permanently failed events and forced-downgrade flags are logged for
    // billing ops; notification delivery is an external collaborator's job.
    let ops_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = ops_billing.clone();
            Box::pin(async move {
                match billing.webhooks.permanently_failed_events(100).await {
                    Ok(events) => {
                        for event in &events {
                            error!(
                                webhook_event_id = %event.id,
                                org_id = %event.org_id,
                                provider = %event.provider,
                                event_type = %event.event_type,
                                retry_count = event.retry_count,
                                last_error = ?event.last_error,
                                "OPERATOR ATTENTION: webhook event exhausted retries"
                            );
                        }
                        if !events.is_empty() {
                            warn!(
                                count = events.len(),
                                "Permanently failed webhook events in operator queue"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to read operator queue"),
                }

                match billing.subscriptions.flagged_for_downgrade().await {
                    Ok(flagged) => {
                        for sub in &flagged {
                            warn!(
                                org_id = %sub.org_id,
                                plan = %sub.plan_slug,
                                failed_payment_count = sub.failed_payment_count,
                                flagged_at = ?sub.downgrade_flagged_at,
                                "OPERATOR ATTENTION: tenant flagged for forced downgrade"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to read downgrade flags"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Operator queue surfacing (every 15 minutes)");

    // Job 3: Trial expiry sweep (hourly)
    let trial_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = trial_billing.clone();
            Box::pin(async move {
                match billing.subscriptions.expire_trials().await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired = expired, "Expired trials"),
                    Err(e) => error!(error = %e, "Trial expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial expiry sweep (hourly)");

    // Job 4: Billing invariant checks (daily at 3:00 AM UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "Billing invariants healthy"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 3:00 AM UTC)");

    // Job 5: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Clinicore Worker started successfully with 5 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
