//! Webhook ingestion and processing
//!
//! Ingestion is the synchronous fast path behind the HTTP route: verify the
//! provider signature, persist the raw delivery as `Pending`, hand its id to
//! the worker queue and return. Nothing is persisted for a bad signature.
//!
//! Processing runs on the worker. A delivery whose (provider, event id) was
//! already processed is marked `Processed` without side effects; otherwise
//! the normalized event is dispatched to the payment service. Unknown payment
//! references and other permanent problems are recorded on the row as
//! `Failed`; transient errors are returned so the worker can retry.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{IngestError, PaymentError};
use crate::gateway::{NormalizedEvent, PaymentGatewayManager, WebhookEventKind};
use crate::models::{Metadata, PaymentWebhook, WebhookStatus};
use crate::services::payment_service::{CaptureData, PaymentService, RefundData};
use crate::store::PaymentStore;

/// Event type recorded when a verified payload cannot be parsed
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

pub struct WebhookIngestor {
    store: Arc<dyn PaymentStore>,
    gateways: Arc<PaymentGatewayManager>,
    queue: Option<mpsc::Sender<Uuid>>,
}

impl WebhookIngestor {
    /// `queue` is `None` when processing is driven manually (tests, replays)
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateways: Arc<PaymentGatewayManager>,
        queue: Option<mpsc::Sender<Uuid>>,
    ) -> Self {
        Self {
            store,
            gateways,
            queue,
        }
    }

    /// Verify, persist and enqueue one delivery. Returns the webhook id.
    pub async fn ingest(
        &self,
        provider: &str,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<Uuid, IngestError> {
        let driver = self
            .gateways
            .driver(provider)
            .ok_or_else(|| IngestError::UnknownProvider(provider.to_string()))?;

        let signature = headers
            .get(driver.signature_header())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let verified = signature.as_deref().is_some_and(|sig| {
            driver.verify_webhook_signature(payload, sig, driver.webhook_secret())
        });
        if !verified {
            tracing::warn!(
                target: "security",
                provider = %provider,
                header = driver.signature_header(),
                signature_present = signature.is_some(),
                payload_bytes = payload.len(),
                "Webhook signature verification failed"
            );
            return Err(IngestError::InvalidSignature);
        }

        let (event_id, event_type) = match driver.parse_webhook_event(payload) {
            Ok(event) => (Some(event.event_id), event.provider_event_type),
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "Verified webhook could not be parsed");
                (None, UNKNOWN_EVENT_TYPE.to_string())
            }
        };

        let webhook = PaymentWebhook {
            id: Uuid::new_v4(),
            provider: driver.name().to_string(),
            event_id,
            event_type,
            payload: payload.to_vec(),
            signature,
            status: WebhookStatus::Pending,
            attempts: 0,
            metadata: Metadata::new(),
            received_at: Utc::now(),
            processed_at: None,
        };

        let mut tx = self.store.begin().await?;
        tx.insert_webhook(&webhook).await?;
        tx.commit().await?;

        tracing::info!(
            webhook_id = %webhook.id,
            provider = %webhook.provider,
            event_id = webhook.event_id.as_deref().unwrap_or(""),
            event_type = %webhook.event_type,
            "Webhook accepted"
        );

        if let Some(queue) = &self.queue {
            if let Err(e) = queue.try_send(webhook.id) {
                // Stays Pending; the worker's requeue pass picks it up
                tracing::warn!(webhook_id = %webhook.id, error = %e, "Webhook queue unavailable");
            }
        }

        Ok(webhook.id)
    }
}

/// How a processing run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    /// Same provider event was already processed under another row
    Duplicate { original: Uuid },
    /// Event type outside the handled vocabulary
    Ignored,
    /// Recorded as `Failed` on the row
    Failed(String),
    /// Row was already processed before this run
    AlreadyProcessed,
}

pub struct WebhookProcessor {
    store: Arc<dyn PaymentStore>,
    gateways: Arc<PaymentGatewayManager>,
    payments: Arc<PaymentService>,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateways: Arc<PaymentGatewayManager>,
        payments: Arc<PaymentService>,
    ) -> Self {
        Self {
            store,
            gateways,
            payments,
        }
    }

    /// Process one stored webhook. Only retryable failures are returned as
    /// errors; everything else is recorded on the row.
    pub async fn process(&self, webhook_id: Uuid) -> Result<ProcessOutcome, PaymentError> {
        let webhook = self
            .store
            .get_webhook(webhook_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("webhook {}", webhook_id)))?;

        if webhook.status == WebhookStatus::Processed {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        if let Some(event_id) = &webhook.event_id {
            if let Some(original) = self.check_duplicate(&webhook, event_id).await? {
                return Ok(ProcessOutcome::Duplicate { original });
            }
        }

        let Some(driver) = self.gateways.driver(&webhook.provider) else {
            let reason = format!("no gateway driver registered under '{}'", webhook.provider);
            return self.fail(webhook_id, &reason, Metadata::new()).await;
        };

        let event = match driver.parse_webhook_event(&webhook.payload) {
            Ok(event) => event,
            Err(e) => {
                let reason = format!("unparseable payload: {}", e);
                return self.fail(webhook_id, &reason, Metadata::new()).await;
            }
        };

        if event.kind == WebhookEventKind::Unhandled {
            let mut extra = Metadata::new();
            extra.insert("ignored".to_string(), Value::Bool(true));
            self.finish(webhook_id, WebhookStatus::Processed, extra).await?;
            tracing::info!(
                webhook_id = %webhook_id,
                event_type = %event.provider_event_type,
                "Webhook event type not handled, ignored"
            );
            return Ok(ProcessOutcome::Ignored);
        }

        let Some(transaction_id) = event.provider_transaction_id.clone() else {
            return self
                .fail(webhook_id, "event carries no transaction id", Metadata::new())
                .await;
        };

        let Some(payment) = self
            .store
            .find_payment_by_provider_ref(&webhook.provider, &transaction_id)
            .await?
        else {
            let mut extra = Metadata::new();
            extra.insert("provider_payment_id".to_string(), json!(transaction_id));
            let reason = format!("no payment with provider_payment_id '{}'", transaction_id);
            return self.fail(webhook_id, &reason, extra).await;
        };

        match self.dispatch(payment.id, event).await {
            Ok(()) => {
                let mut extra = Metadata::new();
                extra.insert("payment_id".to_string(), json!(payment.id));
                self.finish(webhook_id, WebhookStatus::Processed, extra).await?;
                tracing::info!(webhook_id = %webhook_id, payment_id = %payment.id, "Webhook processed");
                Ok(ProcessOutcome::Processed)
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                let mut extra = Metadata::new();
                extra.insert("payment_id".to_string(), json!(payment.id));
                extra.insert("error_code".to_string(), json!(e.error_code()));
                self.fail(webhook_id, &e.to_string(), extra).await
            }
        }
    }

    /// Record a final failure, e.g. after the worker gave up retrying
    pub async fn mark_failed(&self, webhook_id: Uuid, reason: &str) -> Result<(), PaymentError> {
        self.fail(webhook_id, reason, Metadata::new()).await.map(|_| ())
    }

    async fn dispatch(&self, payment_id: Uuid, event: NormalizedEvent) -> Result<(), PaymentError> {
        match event.kind {
            WebhookEventKind::TransactionSucceeded => {
                let data = CaptureData {
                    provider_intent_id: None,
                    amount: event.amount,
                    charge_ref: event.charge_ref,
                };
                self.payments.capture_payment(payment_id, data).await?;
            }
            WebhookEventKind::TransactionFailed => {
                self.payments
                    .fail_payment(payment_id, event.failure_reason)
                    .await?;
            }
            WebhookEventKind::TransactionRefunded => {
                let data = RefundData {
                    amount: event.amount,
                    reason: format!("provider refund ({})", event.provider_event_type),
                    provider_refund_id: Some(
                        event.provider_refund_id.unwrap_or(event.event_id),
                    ),
                };
                self.payments.refund(payment_id, data).await?;
            }
            WebhookEventKind::Unhandled => {}
        }
        Ok(())
    }

    async fn check_duplicate(
        &self,
        webhook: &PaymentWebhook,
        event_id: &str,
    ) -> Result<Option<Uuid>, PaymentError> {
        let mut tx = self.store.begin().await?;
        let Some(original) = tx
            .find_processed_webhook(&webhook.provider, event_id, webhook.id)
            .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        let Some(mut row) = tx.lock_webhook(webhook.id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let now = Utc::now();
        row.status = WebhookStatus::Processed;
        row.processed_at = Some(now);
        row.attempts += 1;
        row.metadata
            .insert("duplicate_of".to_string(), json!(original));
        tx.update_webhook(&row).await?;
        tx.commit().await?;

        tracing::info!(
            webhook_id = %webhook.id,
            duplicate_of = %original,
            event_id = %event_id,
            "Duplicate webhook delivery, skipping"
        );
        Ok(Some(original))
    }

    async fn fail(
        &self,
        webhook_id: Uuid,
        reason: &str,
        mut extra: Metadata,
    ) -> Result<ProcessOutcome, PaymentError> {
        extra.insert("error".to_string(), Value::String(reason.to_string()));
        self.finish(webhook_id, WebhookStatus::Failed, extra).await?;
        tracing::warn!(webhook_id = %webhook_id, reason = %reason, "Webhook processing failed");
        Ok(ProcessOutcome::Failed(reason.to_string()))
    }

    async fn finish(
        &self,
        webhook_id: Uuid,
        status: WebhookStatus,
        extra: Metadata,
    ) -> Result<(), PaymentError> {
        let mut tx = self.store.begin().await?;
        let mut webhook = tx
            .lock_webhook(webhook_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("webhook {}", webhook_id)))?;

        webhook.status = status;
        webhook.attempts += 1;
        if status == WebhookStatus::Processed {
            webhook.processed_at = Some(Utc::now());
        }
        webhook.metadata.extend(extra);
        tx.update_webhook(&webhook).await?;
        tx.commit().await?;
        Ok(())
    }
}
