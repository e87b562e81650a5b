//! In-process store
//!
//! A transaction takes the store mutex for its whole lifetime and works on a
//! copy of the tables, swapped in on commit. That makes every transaction
//! serializable, which is the strongest form of the row locks `PgStore`
//! takes. Callers must not read through the store while holding a
//! transaction on the same task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{PaymentStore, StoreTx};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Direction, IntentStatus, LedgerEntry, Payment, PaymentIntent, PaymentMethod, PaymentStatus,
    PaymentSubscription, PaymentWebhook, Refund, RefundStatus, WebhookStatus,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    intents: HashMap<Uuid, PaymentIntent>,
    payments: HashMap<Uuid, Payment>,
    refunds: HashMap<Uuid, Refund>,
    ledger: Vec<LedgerEntry>,
    webhooks: HashMap<Uuid, PaymentWebhook>,
    subscriptions: HashMap<Uuid, PaymentSubscription>,
    payment_methods: HashMap<Uuid, PaymentMethod>,
}

impl Tables {
    fn has_entry(&self, payment_id: Uuid, refund_id: Option<Uuid>, direction: Direction) -> bool {
        self.ledger.iter().any(|e| {
            e.payment_id == payment_id && e.refund_id == refund_id && e.direction == direction
        })
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<CommitFaults>,
}

/// Injected commit failures for exercising recovery paths
#[derive(Debug, Default)]
struct CommitFaults {
    skip: AtomicUsize,
    fail: AtomicUsize,
}

impl CommitFaults {
    /// True when this commit should fail
    fn take(&self) -> bool {
        if self.fail.load(Ordering::SeqCst) == 0 {
            return false;
        }
        let decrement = |n: usize| n.checked_sub(1);
        if self.skip.fetch_update(Ordering::SeqCst, Ordering::SeqCst, decrement).is_ok() {
            return false;
        }
        self.fail.fetch_update(Ordering::SeqCst, Ordering::SeqCst, decrement).is_ok()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with `StoreError::Unavailable`,
    /// discarding their writes
    pub fn fail_next_commits(&self, count: usize) {
        self.fail_commits_after(0, count);
    }

    /// Let `skip` commits through, then fail the following `count`
    pub fn fail_commits_after(&self, skip: usize, count: usize) {
        self.faults.skip.store(skip, Ordering::SeqCst);
        self.faults.fail.store(count, Ordering::SeqCst);
    }
}

fn sorted_refunds<'a>(refunds: impl Iterator<Item = &'a Refund>, payment_id: Uuid) -> Vec<Refund> {
    let mut out: Vec<Refund> = refunds
        .filter(|r| r.payment_id == payment_id)
        .cloned()
        .collect();
    out.sort_by_key(|r| r.created_at);
    out
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            faults: self.faults.clone(),
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get_intent(&self, id: Uuid) -> StoreResult<Option<PaymentIntent>> {
        Ok(self.tables.lock().await.intents.get(&id).cloned())
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self.tables.lock().await.payments.get(&id).cloned())
    }

    async fn find_payment_by_provider_ref(
        &self,
        provider: &str,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payments
            .values()
            .filter(|p| {
                p.provider == provider
                    && p.provider_payment_id.as_deref() == Some(provider_payment_id)
            })
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    async fn list_refunds(&self, payment_id: Uuid) -> StoreResult<Vec<Refund>> {
        let tables = self.tables.lock().await;
        Ok(sorted_refunds(tables.refunds.values(), payment_id))
    }

    async fn unposted_capture_ids(&self, limit: i64) -> StoreResult<Vec<Uuid>> {
        let tables = self.tables.lock().await;
        let mut unposted: Vec<&Payment> = tables
            .payments
            .values()
            .filter(|p| p.status.is_captured())
            .filter(|p| {
                let credit_missing = p.payee_id.is_some()
                    && p.net_amount.is_positive()
                    && !tables.has_entry(p.id, None, Direction::Credit);
                let debit_missing =
                    p.payer_id.is_some() && !tables.has_entry(p.id, None, Direction::Debit);
                credit_missing || debit_missing
            })
            .collect();
        unposted.sort_by_key(|p| (p.captured_at, p.id));
        Ok(unposted
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|p| p.id)
            .collect())
    }

    async fn unposted_refund_ids(&self, limit: i64) -> StoreResult<Vec<(Uuid, Uuid)>> {
        let tables = self.tables.lock().await;
        let mut unposted: Vec<&Refund> = tables
            .refunds
            .values()
            .filter(|r| r.status == RefundStatus::Succeeded)
            .filter(|r| {
                let Some(payment) = tables.payments.get(&r.payment_id) else {
                    return false;
                };
                let debit_missing = payment.payee_id.is_some()
                    && !tables.has_entry(payment.id, Some(r.id), Direction::Debit);
                let credit_missing = payment.payer_id.is_some()
                    && !tables.has_entry(payment.id, Some(r.id), Direction::Credit);
                debit_missing || credit_missing
            })
            .collect();
        unposted.sort_by_key(|r| (r.refunded_at, r.id));
        Ok(unposted
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| (r.payment_id, r.id))
            .collect())
    }

    async fn list_ledger_entries(&self, payment_id: Uuid) -> StoreResult<Vec<LedgerEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .ledger
            .iter()
            .filter(|e| e.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn get_webhook(&self, id: Uuid) -> StoreResult<Option<PaymentWebhook>> {
        Ok(self.tables.lock().await.webhooks.get(&id).cloned())
    }

    async fn count_webhooks(&self, provider: &str) -> StoreResult<i64> {
        let tables = self.tables.lock().await;
        Ok(tables
            .webhooks
            .values()
            .filter(|w| w.provider == provider)
            .count() as i64)
    }

    async fn pending_webhook_ids(
        &self,
        received_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Uuid>> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<&PaymentWebhook> = tables
            .webhooks
            .values()
            .filter(|w| w.status == WebhookStatus::Pending && w.received_at < received_before)
            .collect();
        pending.sort_by_key(|w| w.received_at);
        Ok(pending
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|w| w.id)
            .collect())
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<PaymentSubscription>> {
        Ok(self.tables.lock().await.subscriptions.get(&id).cloned())
    }

    async fn due_subscription_ids(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let tables = self.tables.lock().await;
        let mut due: Vec<&PaymentSubscription> = tables
            .subscriptions
            .values()
            .filter(|s| s.is_due_at(now))
            .collect();
        due.sort_by_key(|s| s.ends_at);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|s| s.id)
            .collect())
    }

    async fn reminder_candidate_ids(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Uuid>> {
        let tables = self.tables.lock().await;
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = tables
            .subscriptions
            .values()
            .filter_map(|s| s.pending_reminder(now, until).map(|(at, _)| (at, s.id)))
            .collect();
        candidates.sort();
        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id)
            .collect())
    }

    async fn list_payment_methods(&self, user_id: i64) -> StoreResult<Vec<PaymentMethod>> {
        let tables = self.tables.lock().await;
        let mut methods: Vec<PaymentMethod> = tables
            .payment_methods
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        methods.sort_by_key(|m| m.created_at);
        Ok(methods)
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
    faults: Arc<CommitFaults>,
}

fn missing(kind: &str, id: Uuid) -> StoreError {
    StoreError::NotFound(format!("{} {}", kind, id))
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_intent(&mut self, intent: &PaymentIntent) -> StoreResult<()> {
        if self.work.intents.contains_key(&intent.id) {
            return Err(StoreError::Conflict(format!("intent {} exists", intent.id)));
        }
        self.work.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn lock_intent(&mut self, id: Uuid) -> StoreResult<Option<PaymentIntent>> {
        Ok(self.work.intents.get(&id).cloned())
    }

    async fn update_intent(&mut self, intent: &PaymentIntent) -> StoreResult<()> {
        match self.work.intents.get_mut(&intent.id) {
            Some(row) => {
                *row = intent.clone();
                Ok(())
            }
            None => Err(missing("intent", intent.id)),
        }
    }

    async fn lock_expirable_intents(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentIntent>> {
        let mut due: Vec<PaymentIntent> = self
            .work
            .intents
            .values()
            .filter(|i| IntentStatus::EXPIRABLE.contains(&i.status) && i.is_expired_at(now))
            .cloned()
            .collect();
        due.sort_by_key(|i| i.expires_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> StoreResult<()> {
        if self.work.payments.contains_key(&payment.id) {
            return Err(StoreError::Conflict(format!("payment {} exists", payment.id)));
        }
        self.work.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn lock_payment(&mut self, id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self.work.payments.get(&id).cloned())
    }

    async fn update_payment(&mut self, payment: &Payment) -> StoreResult<()> {
        match self.work.payments.get_mut(&payment.id) {
            Some(row) => {
                *row = payment.clone();
                Ok(())
            }
            None => Err(missing("payment", payment.id)),
        }
    }

    async fn lock_stale_pending_payments(
        &mut self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Payment>> {
        let mut stale: Vec<Payment> = self
            .work
            .payments
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Pending
                    && p.intent_id.is_none()
                    && p.created_at < created_before
            })
            .cloned()
            .collect();
        stale.sort_by_key(|p| p.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn insert_refund(&mut self, refund: &Refund) -> StoreResult<()> {
        if let Some(provider_refund_id) = &refund.provider_refund_id {
            let taken = self.work.refunds.values().any(|r| {
                r.payment_id == refund.payment_id
                    && r.provider_refund_id.as_ref() == Some(provider_refund_id)
            });
            if taken {
                return Err(StoreError::Conflict(format!(
                    "refund {} already recorded",
                    provider_refund_id
                )));
            }
        }
        self.work.refunds.insert(refund.id, refund.clone());
        Ok(())
    }

    async fn update_refund(&mut self, refund: &Refund) -> StoreResult<()> {
        match self.work.refunds.get_mut(&refund.id) {
            Some(row) => {
                *row = refund.clone();
                Ok(())
            }
            None => Err(missing("refund", refund.id)),
        }
    }

    async fn refunds_for_payment(&mut self, payment_id: Uuid) -> StoreResult<Vec<Refund>> {
        Ok(sorted_refunds(self.work.refunds.values(), payment_id))
    }

    async fn ledger_entry_exists(
        &mut self,
        payment_id: Uuid,
        refund_id: Option<Uuid>,
        direction: Direction,
    ) -> StoreResult<bool> {
        Ok(self.work.has_entry(payment_id, refund_id, direction))
    }

    async fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        if self
            .ledger_entry_exists(entry.payment_id, entry.refund_id, entry.direction)
            .await?
        {
            return Err(StoreError::Conflict(format!(
                "{} entry for payment {} already posted",
                entry.direction.as_str(),
                entry.payment_id
            )));
        }
        self.work.ledger.push(entry.clone());
        Ok(())
    }

    async fn insert_webhook(&mut self, webhook: &PaymentWebhook) -> StoreResult<()> {
        self.work.webhooks.insert(webhook.id, webhook.clone());
        Ok(())
    }

    async fn lock_webhook(&mut self, id: Uuid) -> StoreResult<Option<PaymentWebhook>> {
        Ok(self.work.webhooks.get(&id).cloned())
    }

    async fn update_webhook(&mut self, webhook: &PaymentWebhook) -> StoreResult<()> {
        match self.work.webhooks.get_mut(&webhook.id) {
            Some(row) => {
                *row = webhook.clone();
                Ok(())
            }
            None => Err(missing("webhook", webhook.id)),
        }
    }

    async fn find_processed_webhook(
        &mut self,
        provider: &str,
        event_id: &str,
        exclude: Uuid,
    ) -> StoreResult<Option<Uuid>> {
        Ok(self
            .work
            .webhooks
            .values()
            .find(|w| {
                w.id != exclude
                    && w.status == WebhookStatus::Processed
                    && w.provider == provider
                    && w.event_id.as_deref() == Some(event_id)
            })
            .map(|w| w.id))
    }

    async fn insert_subscription(
        &mut self,
        subscription: &PaymentSubscription,
    ) -> StoreResult<()> {
        self.work
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn lock_subscription(&mut self, id: Uuid) -> StoreResult<Option<PaymentSubscription>> {
        Ok(self.work.subscriptions.get(&id).cloned())
    }

    async fn update_subscription(
        &mut self,
        subscription: &PaymentSubscription,
    ) -> StoreResult<()> {
        match self.work.subscriptions.get_mut(&subscription.id) {
            Some(row) => {
                *row = subscription.clone();
                Ok(())
            }
            None => Err(missing("subscription", subscription.id)),
        }
    }

    async fn insert_payment_method(&mut self, method: &PaymentMethod) -> StoreResult<()> {
        let duplicate = self.work.payment_methods.values().any(|m| {
            m.provider == method.provider && m.provider_method_id == method.provider_method_id
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "payment method {} already vaulted",
                method.provider_method_id
            )));
        }
        if method.is_default
            && self
                .work
                .payment_methods
                .values()
                .any(|m| m.user_id == method.user_id && m.is_default)
        {
            return Err(StoreError::Conflict(format!(
                "user {} already has a default payment method",
                method.user_id
            )));
        }
        self.work.payment_methods.insert(method.id, method.clone());
        Ok(())
    }

    async fn lock_payment_methods_for_user(
        &mut self,
        user_id: i64,
    ) -> StoreResult<Vec<PaymentMethod>> {
        let mut methods: Vec<PaymentMethod> = self
            .work
            .payment_methods
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        methods.sort_by_key(|m| m.created_at);
        Ok(methods)
    }

    async fn update_payment_method(&mut self, method: &PaymentMethod) -> StoreResult<()> {
        if method.is_default
            && self.work.payment_methods.values().any(|m| {
                m.user_id == method.user_id && m.is_default && m.id != method.id
            })
        {
            return Err(StoreError::Conflict(format!(
                "user {} already has a default payment method",
                method.user_id
            )));
        }
        match self.work.payment_methods.get_mut(&method.id) {
            Some(row) => {
                *row = method.clone();
                Ok(())
            }
            None => Err(missing("payment method", method.id)),
        }
    }

    async fn delete_payment_method(&mut self, id: Uuid) -> StoreResult<bool> {
        let removed = self.work.payment_methods.remove(&id).is_some();
        if removed {
            for payment in self.work.payments.values_mut() {
                if payment.payment_method_id == Some(id) {
                    payment.payment_method_id = None;
                }
            }
        }
        Ok(removed)
    }

    async fn delete_terminal_intents(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<u64> {
        let mut victims: Vec<(DateTime<Utc>, Uuid)> = self
            .work
            .intents
            .values()
            .filter(|i| i.is_terminal() && i.updated_at < cutoff)
            .map(|i| (i.updated_at, i.id))
            .collect();
        victims.sort();
        victims.truncate(limit.max(0) as usize);
        for (_, id) in &victims {
            self.work.intents.remove(id);
        }
        Ok(victims.len() as u64)
    }

    async fn delete_orphan_payments(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<u64> {
        let tables = &self.work;
        let mut victims: Vec<(DateTime<Utc>, Uuid)> = tables
            .payments
            .values()
            .filter(|p| {
                !p.status.is_captured()
                    && p.created_at < cutoff
                    && !tables.ledger.iter().any(|e| e.payment_id == p.id)
                    && !tables.refunds.values().any(|r| r.payment_id == p.id)
                    && !tables.intents.values().any(|i| i.payment_id == Some(p.id))
            })
            .map(|p| (p.created_at, p.id))
            .collect();
        victims.sort();
        victims.truncate(limit.max(0) as usize);
        for (_, id) in &victims {
            self.work.payments.remove(id);
        }
        Ok(victims.len() as u64)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx {
            mut guard,
            work,
            faults,
        } = *self;
        if faults.take() {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
