//! Persistence port
//!
//! [`PaymentStore`] exposes plain reads and opens units of work. Every
//! mutation happens inside a [`StoreTx`]: callers lock the rows they are about
//! to change (`lock_*`), re-check state, write, then commit. Dropping a
//! transaction without committing discards its writes.
//!
//! Two implementations: [`postgres::PgStore`] for production and
//! [`memory::MemoryStore`] for tests and local runs.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{
    Direction, LedgerEntry, Payment, PaymentIntent, PaymentMethod, PaymentSubscription,
    PaymentWebhook, Refund,
};

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    /// Cheap reachability check for readiness checks
    async fn ping(&self) -> StoreResult<()>;

    async fn get_intent(&self, id: Uuid) -> StoreResult<Option<PaymentIntent>>;

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>>;

    async fn find_payment_by_provider_ref(
        &self,
        provider: &str,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Payment>>;

    async fn list_refunds(&self, payment_id: Uuid) -> StoreResult<Vec<Refund>>;

    async fn list_ledger_entries(&self, payment_id: Uuid) -> StoreResult<Vec<LedgerEntry>>;

    /// Captured payments with an empty capture slot for a present party
    async fn unposted_capture_ids(&self, limit: i64) -> StoreResult<Vec<Uuid>>;

    /// `(payment_id, refund_id)` of succeeded refunds with an empty reversal
    /// slot for a present party
    async fn unposted_refund_ids(&self, limit: i64) -> StoreResult<Vec<(Uuid, Uuid)>>;

    async fn get_webhook(&self, id: Uuid) -> StoreResult<Option<PaymentWebhook>>;

    async fn count_webhooks(&self, provider: &str) -> StoreResult<i64>;

    /// Pending webhooks received before `received_before`, oldest first
    async fn pending_webhook_ids(
        &self,
        received_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Uuid>>;

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<PaymentSubscription>>;

    /// Subscriptions the expiry sweep must look at
    async fn due_subscription_ids(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>>;

    /// Subscriptions whose period (or grace) boundary falls in `(now, until]`
    /// and that have not been reminded for that boundary yet
    async fn reminder_candidate_ids(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Uuid>>;

    async fn list_payment_methods(&self, user_id: i64) -> StoreResult<Vec<PaymentMethod>>;
}

/// Unit of work. `lock_*` reads take a row lock held until commit/rollback.
#[async_trait]
pub trait StoreTx: Send {
    // Intents
    async fn insert_intent(&mut self, intent: &PaymentIntent) -> StoreResult<()>;
    async fn lock_intent(&mut self, id: Uuid) -> StoreResult<Option<PaymentIntent>>;
    async fn update_intent(&mut self, intent: &PaymentIntent) -> StoreResult<()>;
    /// Non-terminal intents with `expires_at <= now`; rows locked by another
    /// sweep are skipped
    async fn lock_expirable_intents(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentIntent>>;

    // Payments
    async fn insert_payment(&mut self, payment: &Payment) -> StoreResult<()>;
    async fn lock_payment(&mut self, id: Uuid) -> StoreResult<Option<Payment>>;
    async fn update_payment(&mut self, payment: &Payment) -> StoreResult<()>;
    /// Pending payments with no intent, created before `created_before`
    async fn lock_stale_pending_payments(
        &mut self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Payment>>;

    // Refunds
    async fn insert_refund(&mut self, refund: &Refund) -> StoreResult<()>;
    async fn update_refund(&mut self, refund: &Refund) -> StoreResult<()>;
    async fn refunds_for_payment(&mut self, payment_id: Uuid) -> StoreResult<Vec<Refund>>;

    // Ledger
    async fn ledger_entry_exists(
        &mut self,
        payment_id: Uuid,
        refund_id: Option<Uuid>,
        direction: Direction,
    ) -> StoreResult<bool>;
    /// Fails with `Conflict` when the (payment/refund, direction) slot is taken
    async fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()>;

    // Webhooks
    async fn insert_webhook(&mut self, webhook: &PaymentWebhook) -> StoreResult<()>;
    async fn lock_webhook(&mut self, id: Uuid) -> StoreResult<Option<PaymentWebhook>>;
    async fn update_webhook(&mut self, webhook: &PaymentWebhook) -> StoreResult<()>;
    /// Another webhook from `provider` with `event_id` already processed
    async fn find_processed_webhook(
        &mut self,
        provider: &str,
        event_id: &str,
        exclude: Uuid,
    ) -> StoreResult<Option<Uuid>>;

    // Subscriptions
    async fn insert_subscription(&mut self, subscription: &PaymentSubscription)
        -> StoreResult<()>;
    async fn lock_subscription(&mut self, id: Uuid) -> StoreResult<Option<PaymentSubscription>>;
    async fn update_subscription(&mut self, subscription: &PaymentSubscription)
        -> StoreResult<()>;

    // Payment methods
    async fn insert_payment_method(&mut self, method: &PaymentMethod) -> StoreResult<()>;
    async fn lock_payment_methods_for_user(&mut self, user_id: i64)
        -> StoreResult<Vec<PaymentMethod>>;
    async fn update_payment_method(&mut self, method: &PaymentMethod) -> StoreResult<()>;
    async fn delete_payment_method(&mut self, id: Uuid) -> StoreResult<bool>;

    // Retention cleanup
    /// Terminal intents last updated before `cutoff`
    async fn delete_terminal_intents(&mut self, cutoff: DateTime<Utc>, limit: i64)
        -> StoreResult<u64>;
    /// Never-captured payments without ledger entries or refunds, created
    /// before `cutoff` and no longer referenced by an intent
    async fn delete_orphan_payments(&mut self, cutoff: DateTime<Utc>, limit: i64)
        -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
