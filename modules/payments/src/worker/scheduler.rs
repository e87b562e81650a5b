//! Periodic sweeps
//!
//! Each job runs on its own `tokio::time::interval`. A failing run is logged
//! and the job keeps its schedule; overlapping runs across processes are safe
//! because the sweeps lock their batches with `SKIP LOCKED`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::webhook_worker::requeue_pending;
use crate::config::Config;
use crate::services::{CleanupService, LedgerPoster, PaymentService, SubscriptionService};
use crate::store::PaymentStore;

const CLEANUP_PERIOD: StdDuration = StdDuration::from_secs(24 * 60 * 60);
/// Pending webhooks older than this are assumed dropped from the queue
const WEBHOOK_REQUEUE_AGE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sweep_interval: StdDuration,
    pub batch_size: i64,
    pub retention: Duration,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            sweep_interval: config.sweep_interval,
            batch_size: config.sweep_batch_size,
            retention: config.intent_retention,
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn PaymentStore>,
    payments: Arc<PaymentService>,
    subscriptions: Arc<SubscriptionService>,
    cleanup: Arc<CleanupService>,
    ledger: Arc<LedgerPoster>,
    webhook_queue: Option<mpsc::Sender<Uuid>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        payments: Arc<PaymentService>,
        subscriptions: Arc<SubscriptionService>,
        cleanup: Arc<CleanupService>,
        ledger: Arc<LedgerPoster>,
        webhook_queue: Option<mpsc::Sender<Uuid>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            payments,
            subscriptions,
            cleanup,
            ledger,
            webhook_queue,
            config,
        }
    }

    /// Run every job until the task is dropped
    pub async fn run(self) {
        let batch = self.config.batch_size;
        let every = self.config.sweep_interval;
        let mut jobs: Vec<BoxFuture<'static, ()>> = Vec::new();

        let payments = self.payments.clone();
        jobs.push(
            every_period("expire_intents", every, move || {
                let payments = payments.clone();
                async move {
                    let now = Utc::now();
                    let summary = payments.expire_due_intents(now, batch).await?;
                    let stale = payments.expire_stale_payments(now, batch).await?;
                    if summary.intents_cancelled > 0 || stale > 0 {
                        tracing::info!(
                            intents = summary.intents_cancelled,
                            payments = summary.payments_cancelled + stale,
                            "Expiry sweep cancelled records"
                        );
                    }
                    anyhow::Ok(())
                }
            })
            .boxed(),
        );

        let subscriptions = self.subscriptions.clone();
        jobs.push(
            every_period("expire_subscriptions", every, move || {
                let subscriptions = subscriptions.clone();
                async move {
                    subscriptions.expire_due(Utc::now(), batch).await?;
                    anyhow::Ok(())
                }
            })
            .boxed(),
        );

        let subscriptions = self.subscriptions.clone();
        jobs.push(
            every_period("renewal_reminders", every, move || {
                let subscriptions = subscriptions.clone();
                async move {
                    subscriptions.send_renewal_reminders(Utc::now(), batch).await?;
                    anyhow::Ok(())
                }
            })
            .boxed(),
        );

        let cleanup = self.cleanup.clone();
        let retention = self.config.retention;
        jobs.push(
            every_period("cleanup", CLEANUP_PERIOD, move || {
                let cleanup = cleanup.clone();
                async move {
                    cleanup.cleanup_stale(Utc::now(), retention, batch).await?;
                    anyhow::Ok(())
                }
            })
            .boxed(),
        );

        let ledger = self.ledger.clone();
        jobs.push(
            every_period("reconcile_ledger", every, move || {
                let ledger = ledger.clone();
                async move {
                    ledger.reconcile(batch).await?;
                    anyhow::Ok(())
                }
            })
            .boxed(),
        );

        if let Some(queue) = self.webhook_queue.clone() {
            let store = self.store.clone();
            jobs.push(
                every_period("requeue_webhooks", every, move || {
                    let store = store.clone();
                    let queue = queue.clone();
                    async move {
                        let before = Utc::now() - Duration::seconds(WEBHOOK_REQUEUE_AGE_SECS);
                        requeue_pending(store.as_ref(), &queue, before, batch).await?;
                        anyhow::Ok(())
                    }
                })
                .boxed(),
            );
        }

        tracing::info!(jobs = jobs.len(), interval_secs = every.as_secs(), "Scheduler started");
        join_all(jobs).await;
    }
}

async fn every_period<F, Fut>(name: &'static str, period: StdDuration, job: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Err(e) = job().await {
            tracing::error!(job = name, error = %format!("{:#}", e), "Scheduled job failed");
        }
    }
}
