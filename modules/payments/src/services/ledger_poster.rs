//! Ledger poster
//!
//! Bus listener that turns captures and refunds into double-entry rows:
//!
//! | Event    | Payee                 | Payer                |
//! |----------|-----------------------|----------------------|
//! | capture  | Credit net amount     | Debit gross amount   |
//! | refund   | Debit refund amount   | Credit refund amount |
//!
//! Each (payment, direction) slot for captures and (refund, direction) slot
//! for refunds is written at most once: the poster locks the payment, checks
//! for an existing entry, then inserts, and the store's unique index backs
//! the check. A side whose party is absent is skipped.
//!
//! The listener is best effort: a posting that exhausts its retries is only
//! logged. [`LedgerPoster::reconcile`] runs on the scheduler and fills any
//! slot the listener left empty.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{EventEnvelope, EventHandler, HandlerError};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::events::PaymentEvent;
use crate::models::{
    Direction, LedgerEntry, Ledgerable, Metadata, Payment, Refund, PAYMENTS_LEDGER,
};
use crate::money::Money;
use crate::store::{PaymentStore, StoreTx};

pub struct LedgerPoster {
    store: Arc<dyn PaymentStore>,
}

/// Entries written by one reconciliation run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub capture_entries: usize,
    pub refund_entries: usize,
    /// Payments or refunds whose posting failed again this run
    pub failures: usize,
}

impl ReconcileSummary {
    pub fn entries(&self) -> usize {
        self.capture_entries + self.refund_entries
    }
}

struct Posting {
    direction: Direction,
    party: Option<i64>,
    amount: Money,
}

impl LedgerPoster {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    /// Post both sides of a capture. Returns the number of entries written.
    pub async fn post_capture(
        &self,
        payment_id: Uuid,
        occurred_at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut tx = self.store.begin().await?;
        let payment = lock_payment(tx.as_mut(), payment_id).await?;

        if !payment.status.is_captured() {
            tx.rollback().await?;
            tracing::warn!(
                payment_id = %payment.id,
                status = payment.status.as_str(),
                "Skipping ledger posting for uncaptured payment"
            );
            return Ok(0);
        }

        let postings = [
            Posting {
                direction: Direction::Credit,
                party: payment.payee_id,
                amount: payment.net_amount,
            },
            Posting {
                direction: Direction::Debit,
                party: payment.payer_id,
                amount: payment.amount,
            },
        ];
        let mut metadata = Metadata::new();
        metadata.insert("payment_uuid".to_string(), json!(payment.uuid));
        metadata.insert("payable_type".to_string(), json!(payment.payable.kind().as_str()));
        metadata.insert("payable_id".to_string(), json!(payment.payable.id()));
        metadata.insert("fee_amount".to_string(), json!(payment.fee_amount.amount_minor));

        write_postings(tx, &payment, None, &postings, metadata, occurred_at).await
    }

    /// Post the reversal for one refund
    pub async fn post_refund(
        &self,
        payment_id: Uuid,
        refund: &Refund,
        occurred_at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut tx = self.store.begin().await?;
        let payment = lock_payment(tx.as_mut(), payment_id).await?;

        let postings = [
            Posting {
                direction: Direction::Debit,
                party: payment.payee_id,
                amount: refund.amount,
            },
            Posting {
                direction: Direction::Credit,
                party: payment.payer_id,
                amount: refund.amount,
            },
        ];
        let mut metadata = Metadata::new();
        metadata.insert("payment_id".to_string(), json!(payment.id));
        metadata.insert("refund_id".to_string(), json!(refund.id));
        metadata.insert("reason".to_string(), Value::String(refund.reason.clone()));

        write_postings(tx, &payment, Some(refund.id), &postings, metadata, occurred_at).await
    }
}

impl LedgerPoster {
    /// Post every capture and refund still missing a ledger slot,
    /// `batch_size` at a time. Safe to run alongside the listener.
    pub async fn reconcile(&self, batch_size: i64) -> StoreResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        loop {
            let before = summary;
            let ids = self.store.unposted_capture_ids(batch_size).await?;
            let fetched = ids.len() as i64;

            for payment_id in ids {
                let Some(payment) = self.store.get_payment(payment_id).await? else {
                    continue;
                };
                let occurred_at = payment.captured_at.unwrap_or_else(Utc::now);
                match self.post_capture(payment_id, occurred_at).await {
                    Ok(written) => summary.capture_entries += written,
                    Err(e) => {
                        summary.failures += 1;
                        tracing::error!(payment_id = %payment_id, error = %e, "Capture posting still failing");
                    }
                }
            }

            if fetched < batch_size || summary.capture_entries == before.capture_entries {
                break;
            }
        }

        loop {
            let before = summary;
            let ids = self.store.unposted_refund_ids(batch_size).await?;
            let fetched = ids.len() as i64;

            for (payment_id, refund_id) in ids {
                let refunds = self.store.list_refunds(payment_id).await?;
                let Some(refund) = refunds.into_iter().find(|r| r.id == refund_id) else {
                    continue;
                };
                let occurred_at = refund.refunded_at.unwrap_or_else(Utc::now);
                match self.post_refund(payment_id, &refund, occurred_at).await {
                    Ok(written) => summary.refund_entries += written,
                    Err(e) => {
                        summary.failures += 1;
                        tracing::error!(refund_id = %refund_id, error = %e, "Refund posting still failing");
                    }
                }
            }

            if fetched < batch_size || summary.refund_entries == before.refund_entries {
                break;
            }
        }

        if summary.entries() > 0 {
            tracing::warn!(
                capture_entries = summary.capture_entries,
                refund_entries = summary.refund_entries,
                "Reconciliation posted missing ledger entries"
            );
        }
        Ok(summary)
    }
}

async fn lock_payment(tx: &mut dyn StoreTx, payment_id: Uuid) -> StoreResult<Payment> {
    tx.lock_payment(payment_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("payment {}", payment_id)))
}

async fn write_postings(
    mut tx: Box<dyn StoreTx>,
    payment: &Payment,
    refund_id: Option<Uuid>,
    postings: &[Posting],
    metadata: Metadata,
    occurred_at: DateTime<Utc>,
) -> StoreResult<usize> {
    let mut written = 0;

    for posting in postings {
        let Some(party) = posting.party else {
            continue;
        };
        if !posting.amount.is_positive() {
            continue;
        }
        if tx
            .ledger_entry_exists(payment.id, refund_id, posting.direction)
            .await?
        {
            tracing::debug!(
                payment_id = %payment.id,
                direction = posting.direction.as_str(),
                "Ledger entry already posted"
            );
            continue;
        }

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            ledger: PAYMENTS_LEDGER.to_string(),
            ledgerable: Ledgerable::User(party),
            payment_id: payment.id,
            refund_id,
            direction: posting.direction,
            amount: posting.amount,
            balance_after: None,
            occurred_at,
            metadata: metadata.clone(),
            created_at: Utc::now(),
        };

        match tx.insert_ledger_entry(&entry).await {
            Ok(()) => written += 1,
            Err(StoreError::Conflict(msg)) => {
                // Another poster won the slot; its transaction carries the rest
                tx.rollback().await?;
                tracing::info!(payment_id = %payment.id, conflict = %msg, "Ledger slot taken concurrently");
                return Ok(0);
            }
            Err(e) => return Err(e),
        }
    }

    tx.commit().await?;

    if written > 0 {
        tracing::info!(
            payment_id = %payment.id,
            refund_id = ?refund_id,
            entries = written,
            "Ledger entries posted"
        );
    }
    Ok(written)
}

#[async_trait]
impl EventHandler<PaymentEvent> for LedgerPoster {
    fn name(&self) -> &'static str {
        "ledger_poster"
    }

    async fn handle(&self, envelope: &EventEnvelope<PaymentEvent>) -> Result<(), HandlerError> {
        let result = match &envelope.payload {
            PaymentEvent::PaymentCaptured { payment } => {
                self.post_capture(payment.id, envelope.occurred_at).await
            }
            PaymentEvent::PaymentRefunded { payment, refund } => {
                self.post_refund(payment.id, refund, envelope.occurred_at)
                    .await
            }
            _ => Ok(0),
        };

        result.map(|_| ()).map_err(|e| match e {
            StoreError::Corrupt(_) | StoreError::NotFound(_) => HandlerError::permanent(e),
            _ => HandlerError::transient(e),
        })
    }
}
