use chrono::{DateTime, Utc};
use serde_json::Value;

use super::PaymentService;
use crate::error::PaymentError;
use crate::events::{publish_all, PaymentEvent};
use crate::models::{IntentStatus, PaymentStatus};

/// Metadata flag set on rows cancelled by a sweep
pub const EXPIRED_BY_COMMAND_KEY: &str = "expired_by_command";

/// Counts reported by an expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySummary {
    pub intents_cancelled: u64,
    pub payments_cancelled: u64,
}

impl PaymentService {
    /// Cancel every non-terminal intent whose `expires_at <= now`.
    ///
    /// Each batch of `batch_size` rows is locked (`SKIP LOCKED`) and
    /// cancelled in one transaction, cascading to still-pending payments.
    /// Events for a batch are published after it commits. A sweep that dies
    /// mid-way leaves committed batches done and the rest untouched.
    pub async fn expire_due_intents(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<ExpirySummary, PaymentError> {
        let mut summary = ExpirySummary::default();

        loop {
            let mut tx = self.store.begin().await?;
            let intents = tx.lock_expirable_intents(now, batch_size).await?;
            let fetched = intents.len() as i64;
            if intents.is_empty() {
                tx.rollback().await?;
                break;
            }

            let mut events = Vec::new();
            for mut intent in intents {
                intent.status = IntentStatus::Cancelled;
                intent.cancelled_at = Some(now);
                intent.updated_at = now;
                intent
                    .metadata
                    .insert(EXPIRED_BY_COMMAND_KEY.to_string(), Value::Bool(true));
                tx.update_intent(&intent).await?;
                summary.intents_cancelled += 1;

                let cascaded = match intent.payment_id {
                    Some(payment_id) => tx.lock_payment(payment_id).await?,
                    None => None,
                };

                events.push(PaymentEvent::PaymentIntentCancelled {
                    intent,
                    expired: true,
                });

                if let Some(mut payment) = cascaded {
                    if payment.status == PaymentStatus::Pending {
                        payment.status = PaymentStatus::Cancelled;
                        payment.cancelled_at = Some(now);
                        payment.updated_at = now;
                        payment
                            .metadata
                            .insert(EXPIRED_BY_COMMAND_KEY.to_string(), Value::Bool(true));
                        tx.update_payment(&payment).await?;
                        summary.payments_cancelled += 1;
                        events.push(PaymentEvent::PaymentCancelled { payment });
                    }
                }
            }
            tx.commit().await?;

            tracing::info!(batch = fetched, "Expired payment intents");
            publish_all(&self.bus, events).await;

            if fetched < batch_size {
                break;
            }
        }

        Ok(summary)
    }

    /// Cancel intent-less pending payments older than the intent TTL
    pub async fn expire_stale_payments(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, PaymentError> {
        let cutoff = now - self.intent_ttl;
        let mut cancelled = 0;

        loop {
            let mut tx = self.store.begin().await?;
            let payments = tx.lock_stale_pending_payments(cutoff, batch_size).await?;
            let fetched = payments.len() as i64;
            if payments.is_empty() {
                tx.rollback().await?;
                break;
            }

            let mut events = Vec::with_capacity(payments.len());
            for mut payment in payments {
                payment.status = PaymentStatus::Cancelled;
                payment.cancelled_at = Some(now);
                payment.updated_at = now;
                payment
                    .metadata
                    .insert(EXPIRED_BY_COMMAND_KEY.to_string(), Value::Bool(true));
                tx.update_payment(&payment).await?;
                events.push(PaymentEvent::PaymentCancelled { payment });
            }
            tx.commit().await?;

            cancelled += fetched as u64;
            tracing::info!(batch = fetched, "Cancelled stale pending payments");
            publish_all(&self.bus, events).await;

            if fetched < batch_size {
                break;
            }
        }

        Ok(cancelled)
    }
}
