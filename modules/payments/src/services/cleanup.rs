//! Retention cleanup
//!
//! Removes terminal intents and the orphan payments abandoned behind them
//! once they are older than the retention window. Captured payments and
//! anything with ledger entries or refunds are never touched.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::StoreResult;
use crate::store::PaymentStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub intents_deleted: u64,
    pub payments_deleted: u64,
}

pub struct CleanupService {
    store: Arc<dyn PaymentStore>,
}

impl CleanupService {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    pub async fn cleanup_stale(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
        batch_size: i64,
    ) -> StoreResult<CleanupSummary> {
        let cutoff = now - retention;
        let mut summary = CleanupSummary::default();

        // Intents first: an orphan payment is one no intent points at
        loop {
            let mut tx = self.store.begin().await?;
            let deleted = tx.delete_terminal_intents(cutoff, batch_size).await?;
            tx.commit().await?;
            summary.intents_deleted += deleted;
            if (deleted as i64) < batch_size {
                break;
            }
        }

        loop {
            let mut tx = self.store.begin().await?;
            let deleted = tx.delete_orphan_payments(cutoff, batch_size).await?;
            tx.commit().await?;
            summary.payments_deleted += deleted;
            if (deleted as i64) < batch_size {
                break;
            }
        }

        tracing::info!(
            cutoff = %cutoff,
            intents_deleted = summary.intents_deleted,
            payments_deleted = summary.payments_deleted,
            "Stale payment records cleaned up"
        );
        Ok(summary)
    }
}
