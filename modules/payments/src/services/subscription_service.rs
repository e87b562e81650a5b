//! Subscription lifecycle
//!
//! `Trialing -> Active -> Grace -> {Cancelled | Expired}`. Grace is entered
//! when a period ends (or a renewal charge fails) and a grace window is
//! configured; without one, subscriptions expire directly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::events::{publish_all, PaymentBus, PaymentEvent};
use crate::models::{
    Metadata, PaymentSubscription, SubscriptionStatus, REMINDER_GRACE_KEY,
    REMINDER_PERIOD_END_KEY, REMINDER_SENT_AT_KEY,
};
use crate::store::{PaymentStore, StoreTx};

/// Metadata flag for a subscription that stops at the end of its period
pub const CANCEL_AT_PERIOD_END_KEY: &str = "cancel_at_period_end";

#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub subscriber_id: i64,
    pub creator_id: i64,
    pub plan_ref: String,
    pub ends_at: DateTime<Utc>,
    pub trialing: bool,
    pub auto_renews: bool,
    pub metadata: Metadata,
}

pub struct SubscriptionService {
    store: Arc<dyn PaymentStore>,
    bus: PaymentBus,
    grace: Option<Duration>,
    reminder_lookahead: Duration,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        bus: PaymentBus,
        grace: Option<Duration>,
        reminder_lookahead: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            grace,
            reminder_lookahead,
        }
    }

    pub async fn create(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<PaymentSubscription, PaymentError> {
        let now = Utc::now();
        let subscription = PaymentSubscription {
            id: Uuid::new_v4(),
            uuid: Uuid::new_v4(),
            subscriber_id: request.subscriber_id,
            creator_id: request.creator_id,
            plan_ref: request.plan_ref,
            status: if request.trialing {
                SubscriptionStatus::Trialing
            } else {
                SubscriptionStatus::Active
            },
            auto_renews: request.auto_renews,
            ends_at: request.ends_at,
            grace_ends_at: None,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
            expired_at: None,
        };

        let mut tx = self.store.begin().await?;
        tx.insert_subscription(&subscription).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            subscriber_id = subscription.subscriber_id,
            creator_id = subscription.creator_id,
            status = subscription.status.as_str(),
            "Subscription created"
        );
        Ok(subscription)
    }

    pub async fn get(&self, id: Uuid) -> Result<PaymentSubscription, PaymentError> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("subscription {}", id)))
    }

    /// Advance a due subscription one step. Rows that are not due at `now`
    /// (including terminal ones) are returned unchanged.
    pub async fn expire(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PaymentSubscription, PaymentError> {
        let mut tx = self.store.begin().await?;
        let mut subscription = lock_subscription(tx.as_mut(), id).await?;

        if !subscription.is_due_at(now) {
            tx.rollback().await?;
            return Ok(subscription);
        }

        match subscription.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
                match self.grace_end(&subscription, now) {
                    Some(grace_ends_at) => {
                        subscription.status = SubscriptionStatus::Grace;
                        subscription.grace_ends_at = Some(grace_ends_at);
                    }
                    None => close(&mut subscription, now),
                }
            }
            _ => close(&mut subscription, now),
        }
        subscription.updated_at = now;
        tx.update_subscription(&subscription).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            status = subscription.status.as_str(),
            grace_ends_at = ?subscription.grace_ends_at,
            "Subscription period ended"
        );

        publish_all(&self.bus, vec![transition_event(&subscription)]).await;
        Ok(subscription)
    }

    /// Sweep every due subscription, `batch_size` at a time. Returns the
    /// number of transitions made.
    pub async fn expire_due(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<usize, PaymentError> {
        let mut transitions = 0;

        loop {
            let ids = self.store.due_subscription_ids(now, batch_size).await?;
            let mut progressed = false;

            for id in &ids {
                let before = self.store.get_subscription(*id).await?.map(|s| s.status);
                let after = self.expire(*id, now).await?;
                if before != Some(after.status) {
                    transitions += 1;
                    progressed = true;
                }
            }

            if (ids.len() as i64) < batch_size || !progressed {
                break;
            }
        }

        if transitions > 0 {
            tracing::info!(transitions, "Subscription expiry sweep finished");
        }
        Ok(transitions)
    }

    /// A renewal charge went through: back to Active for the new period
    pub async fn renewal_succeeded(
        &self,
        id: Uuid,
        new_ends_at: DateTime<Utc>,
    ) -> Result<PaymentSubscription, PaymentError> {
        let mut tx = self.store.begin().await?;
        let mut subscription = lock_subscription(tx.as_mut(), id).await?;
        ensure_not_terminal(&subscription)?;

        let now = Utc::now();
        subscription.status = SubscriptionStatus::Active;
        subscription.ends_at = new_ends_at;
        subscription.grace_ends_at = None;
        subscription.updated_at = now;
        tx.update_subscription(&subscription).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            ends_at = %subscription.ends_at,
            "Subscription renewed"
        );
        Ok(subscription)
    }

    /// A renewal charge failed: Grace when a window applies, else Expired
    pub async fn renewal_failed(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PaymentSubscription, PaymentError> {
        let mut tx = self.store.begin().await?;
        let mut subscription = lock_subscription(tx.as_mut(), id).await?;
        ensure_not_terminal(&subscription)?;

        if subscription.status == SubscriptionStatus::Grace {
            tx.rollback().await?;
            return Ok(subscription);
        }

        match self.grace.map(|grace| subscription.ends_at.max(now) + grace) {
            Some(grace_ends_at) => {
                subscription.status = SubscriptionStatus::Grace;
                subscription.grace_ends_at = Some(grace_ends_at);
            }
            None => close(&mut subscription, now),
        }
        subscription.updated_at = now;
        tx.update_subscription(&subscription).await?;
        tx.commit().await?;

        tracing::warn!(
            subscription_id = %subscription.id,
            status = subscription.status.as_str(),
            "Subscription renewal failed"
        );

        publish_all(&self.bus, vec![transition_event(&subscription)]).await;
        Ok(subscription)
    }

    /// Cancel now, or stop renewing and let the period run out
    pub async fn cancel(
        &self,
        id: Uuid,
        immediate: bool,
    ) -> Result<PaymentSubscription, PaymentError> {
        let mut tx = self.store.begin().await?;
        let mut subscription = lock_subscription(tx.as_mut(), id).await?;

        if subscription.status.is_terminal() {
            tx.rollback().await?;
            return Ok(subscription);
        }

        let now = Utc::now();
        subscription.auto_renews = false;
        subscription.updated_at = now;
        if immediate {
            subscription.status = SubscriptionStatus::Cancelled;
            subscription.cancelled_at = Some(now);
            subscription.grace_ends_at = None;
        } else {
            subscription
                .metadata
                .insert(CANCEL_AT_PERIOD_END_KEY.to_string(), Value::Bool(true));
        }
        tx.update_subscription(&subscription).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            immediate,
            "Subscription cancelled"
        );
        Ok(subscription)
    }

    /// Remind subscribers whose period (or grace window) ends within the
    /// lookahead. A subscription is reminded once per period boundary;
    /// candidates already reminded are excluded before `limit` applies.
    pub async fn send_renewal_reminders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<usize, PaymentError> {
        let until = now + self.reminder_lookahead;
        let ids = self.store.reminder_candidate_ids(now, until, limit).await?;
        let mut sent = 0;

        for id in ids {
            let mut tx = self.store.begin().await?;
            let Some(mut subscription) = tx.lock_subscription(id).await? else {
                tx.rollback().await?;
                continue;
            };

            // Re-checked under the lock; a concurrent sweep may have sent it
            let Some((boundary, is_grace_reminder)) = subscription.pending_reminder(now, until)
            else {
                tx.rollback().await?;
                tracing::debug!(subscription_id = %id, "Reminder already sent for this period");
                continue;
            };
            let boundary = boundary.to_rfc3339();

            let metadata = &mut subscription.metadata;
            metadata.insert(
                REMINDER_SENT_AT_KEY.to_string(),
                Value::String(now.to_rfc3339()),
            );
            metadata.insert(REMINDER_PERIOD_END_KEY.to_string(), Value::String(boundary));
            metadata.insert(REMINDER_GRACE_KEY.to_string(), Value::Bool(is_grace_reminder));
            subscription.updated_at = now;
            tx.update_subscription(&subscription).await?;
            tx.commit().await?;

            tracing::info!(
                subscription_id = %subscription.id,
                is_grace_reminder,
                "Renewal reminder scheduled"
            );

            publish_all(
                &self.bus,
                vec![PaymentEvent::SubscriptionRenewalReminder {
                    subscription,
                    is_grace_reminder,
                }],
            )
            .await;
            sent += 1;
        }

        Ok(sent)
    }

    /// End of the grace window for a subscription leaving its period, or
    /// `None` when it should close directly.
    fn grace_end(&self, subscription: &PaymentSubscription, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !subscription.auto_renews || subscription.grace_ends_at.is_some() {
            return None;
        }
        let grace_ends_at = subscription.ends_at + self.grace?;
        (grace_ends_at > now).then_some(grace_ends_at)
    }
}

async fn lock_subscription(
    tx: &mut dyn StoreTx,
    id: Uuid,
) -> Result<PaymentSubscription, PaymentError> {
    tx.lock_subscription(id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("subscription {}", id)))
}

fn ensure_not_terminal(subscription: &PaymentSubscription) -> Result<(), PaymentError> {
    if subscription.status.is_terminal() {
        return Err(PaymentError::InvalidState(format!(
            "subscription {} is {}",
            subscription.id,
            subscription.status.as_str()
        )));
    }
    Ok(())
}

/// Move to the terminal state: Cancelled when the subscriber asked to stop at
/// period end, Expired otherwise.
fn close(subscription: &mut PaymentSubscription, now: DateTime<Utc>) {
    let cancel_requested = subscription
        .metadata
        .get(CANCEL_AT_PERIOD_END_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if cancel_requested {
        subscription.status = SubscriptionStatus::Cancelled;
        subscription.cancelled_at = Some(now);
    } else {
        subscription.status = SubscriptionStatus::Expired;
        subscription.expired_at = Some(now);
    }
}

fn transition_event(subscription: &PaymentSubscription) -> PaymentEvent {
    let subscription = subscription.clone();
    if subscription.status == SubscriptionStatus::Grace {
        PaymentEvent::SubscriptionGraceStarted { subscription }
    } else {
        PaymentEvent::SubscriptionExpired { subscription }
    }
}
