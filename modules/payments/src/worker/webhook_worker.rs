//! Webhook queue consumer
//!
//! Ingestion pushes webhook ids onto a bounded channel; this worker drains it
//! and runs the processor with exponential backoff for retryable errors. A
//! job that exhausts its attempts is marked `Failed` with the last error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use event_bus::consumer_retry::{retry_with_backoff_if, RetryConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{PaymentError, StoreResult};
use crate::services::WebhookProcessor;
use crate::store::PaymentStore;

pub const WEBHOOK_QUEUE_CAPACITY: usize = 1024;

pub fn webhook_queue(capacity: usize) -> (mpsc::Sender<Uuid>, mpsc::Receiver<Uuid>) {
    mpsc::channel(capacity.max(1))
}

pub struct WebhookWorker {
    processor: Arc<WebhookProcessor>,
    retry: RetryConfig,
}

impl WebhookWorker {
    pub fn new(processor: Arc<WebhookProcessor>, retry: RetryConfig) -> Self {
        Self { processor, retry }
    }

    pub fn spawn(self, queue: mpsc::Receiver<Uuid>) -> JoinHandle<()> {
        tokio::spawn(self.run(queue))
    }

    /// Drain the queue until every sender is dropped
    pub async fn run(self, mut queue: mpsc::Receiver<Uuid>) {
        tracing::info!("Webhook worker started");

        while let Some(webhook_id) = queue.recv().await {
            let span = tracing::info_span!("process_webhook", webhook_id = %webhook_id);
            self.handle(webhook_id).instrument(span).await;
        }

        tracing::warn!("Webhook worker stopped");
    }

    /// Process one webhook, retrying transient failures
    pub async fn handle(&self, webhook_id: Uuid) {
        let result = retry_with_backoff_if(
            || self.processor.process(webhook_id),
            &self.retry,
            "webhook_worker",
            |e: &PaymentError| e.is_retryable(),
        )
        .await;

        match result {
            Ok(outcome) => {
                tracing::debug!(outcome = ?outcome, "Webhook job finished");
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    max_attempts = self.retry.max_attempts,
                    "Webhook processing gave up"
                );
                if let Err(mark_err) = self.processor.mark_failed(webhook_id, &e.to_string()).await {
                    tracing::error!(error = %mark_err, "Could not record webhook failure");
                }
            }
        }
    }
}

/// Push still-pending webhooks received before `received_before` back onto
/// the queue. Returns how many were enqueued.
pub async fn requeue_pending(
    store: &dyn PaymentStore,
    queue: &mpsc::Sender<Uuid>,
    received_before: DateTime<Utc>,
    limit: i64,
) -> StoreResult<usize> {
    let ids = store.pending_webhook_ids(received_before, limit).await?;
    let mut enqueued = 0;

    for id in ids {
        match queue.try_send(id) {
            Ok(()) => enqueued += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(enqueued, "Webhook queue full, requeue stopped early");
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    if enqueued > 0 {
        tracing::info!(enqueued, "Pending webhooks requeued");
    }
    Ok(enqueued)
}
