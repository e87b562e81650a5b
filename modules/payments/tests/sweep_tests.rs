//! Scheduled sweeps: intent expiry, subscription lifecycle, renewal
//! reminders and retention cleanup

mod common;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use common::*;
use payments_core_rs::error::PaymentError;
use payments_core_rs::events::{
    SUBJECT_INTENT_CANCELLED, SUBJECT_PAYMENT_CANCELLED, SUBJECT_SUBSCRIPTION_EXPIRED,
    SUBJECT_SUBSCRIPTION_GRACE_STARTED, SUBJECT_SUBSCRIPTION_REMINDER,
};
use payments_core_rs::models::{
    IntentStatus, Metadata, Payable, PaymentStatus, PaymentSubscription, PaymentType,
    SubscriptionStatus, REMINDER_GRACE_KEY,
};
use payments_core_rs::services::payment_service::EXPIRED_BY_COMMAND_KEY;
use payments_core_rs::services::subscription_service::CANCEL_AT_PERIOD_END_KEY;
use payments_core_rs::services::{CreateSubscriptionRequest, ExpirySummary, RecordPaymentRequest};
use payments_core_rs::store::PaymentStore;

async fn subscription(h: &TestHarness, ends_at: DateTime<Utc>) -> PaymentSubscription {
    h.ctx
        .subscriptions
        .create(CreateSubscriptionRequest {
            subscriber_id: PAYER,
            creator_id: PAYEE,
            plan_ref: "monthly".to_string(),
            ends_at,
            trialing: false,
            auto_renews: true,
            metadata: Metadata::new(),
        })
        .await
        .unwrap()
}

async fn reload(h: &TestHarness, id: Uuid) -> PaymentSubscription {
    h.ctx.subscriptions.get(id).await.unwrap()
}

// ============================================================================
// Intent expiry
// ============================================================================

#[tokio::test]
async fn test_expired_intents_are_cancelled_with_their_payments() {
    let h = harness();
    let stale = h.create_intent(1000).await;

    let mut request = intent_request(usd(1000));
    request.expires_at = Some(Utc::now() + Duration::days(1));
    let fresh = h.ctx.payments.create_intent(request).await.unwrap();

    let summary = h
        .ctx
        .payments
        .expire_due_intents(Utc::now() + Duration::hours(2), 100)
        .await
        .unwrap();
    assert_eq!(
        summary,
        ExpirySummary {
            intents_cancelled: 1,
            payments_cancelled: 1,
        }
    );

    let stale = h.ctx.payments.get_intent(stale.id).await.unwrap();
    assert_eq!(stale.status, IntentStatus::Cancelled);
    assert!(stale.cancelled_at.is_some());
    assert_eq!(stale.metadata.get(EXPIRED_BY_COMMAND_KEY), Some(&json!(true)));

    let payment = h.payment(stale.payment_id.unwrap()).await;
    assert_eq!(payment.status, PaymentStatus::Cancelled);
    assert_eq!(payment.metadata.get(EXPIRED_BY_COMMAND_KEY), Some(&json!(true)));

    let fresh = h.ctx.payments.get_intent(fresh.id).await.unwrap();
    assert_eq!(fresh.status, IntentStatus::RequiresConfirmation);

    assert_eq!(h.events.count(SUBJECT_INTENT_CANCELLED), 1);
    assert_eq!(h.events.count(SUBJECT_PAYMENT_CANCELLED), 1);
}

#[tokio::test]
async fn test_expiry_sweeps_in_batches_and_skips_terminal_intents() {
    let h = harness();
    for _ in 0..3 {
        h.create_intent(500).await;
    }
    // Captured before expiry; must not be touched
    let (captured, payment) = h.captured_payment(500).await;

    let summary = h
        .ctx
        .payments
        .expire_due_intents(Utc::now() + Duration::hours(2), 1)
        .await
        .unwrap();
    assert_eq!(summary.intents_cancelled, 3);
    assert_eq!(summary.payments_cancelled, 3);

    let captured = h.ctx.payments.get_intent(captured.id).await.unwrap();
    assert_eq!(captured.status, IntentStatus::Succeeded);
    assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Captured);

    // Nothing left on a second run
    let again = h
        .ctx
        .payments
        .expire_due_intents(Utc::now() + Duration::hours(2), 1)
        .await
        .unwrap();
    assert_eq!(again, ExpirySummary::default());
}

#[tokio::test]
async fn test_stale_standalone_payments_are_cancelled() {
    let h = harness();
    let request = RecordPaymentRequest {
        payable: Payable::Tip(9),
        payer_id: Some(PAYER),
        payee_id: Some(PAYEE),
        amount: usd(300),
        payment_type: PaymentType::OneTime,
        method: "card".to_string(),
        provider: "legacy".to_string(),
        provider_payment_id: None,
        metadata: Metadata::new(),
        captured: false,
    };
    let payment = h.ctx.payments.record_payment(request).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);

    let none_yet = h
        .ctx
        .payments
        .expire_stale_payments(Utc::now(), 100)
        .await
        .unwrap();
    assert_eq!(none_yet, 0);

    let cancelled = h
        .ctx
        .payments
        .expire_stale_payments(Utc::now() + Duration::hours(2), 100)
        .await
        .unwrap();
    assert_eq!(cancelled, 1);
    assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Cancelled);
}

// ============================================================================
// Subscription lifecycle
// ============================================================================

#[tokio::test]
async fn test_lapsed_subscription_enters_grace_then_expires() {
    let h = harness();
    let now = Utc::now();
    let ends_at = now - Duration::days(1);
    let sub = subscription(&h, ends_at).await;

    let transitions = h.ctx.subscriptions.expire_due(now, 100).await.unwrap();
    assert_eq!(transitions, 1);

    let sub = reload(&h, sub.id).await;
    assert_eq!(sub.status, SubscriptionStatus::Grace);
    assert_eq!(sub.grace_ends_at, Some(ends_at + Duration::days(3)));
    assert_eq!(h.events.count(SUBJECT_SUBSCRIPTION_GRACE_STARTED), 1);

    // Still inside the grace window
    assert_eq!(h.ctx.subscriptions.expire_due(now, 100).await.unwrap(), 0);

    let later = now + Duration::days(3);
    assert_eq!(h.ctx.subscriptions.expire_due(later, 100).await.unwrap(), 1);

    let sub = reload(&h, sub.id).await;
    assert_eq!(sub.status, SubscriptionStatus::Expired);
    assert!(sub.expired_at.is_some());
    assert_eq!(h.events.count(SUBJECT_SUBSCRIPTION_EXPIRED), 1);
}

#[tokio::test]
async fn test_grace_window_already_elapsed_expires_directly() {
    let h = harness();
    let now = Utc::now();
    let sub = subscription(&h, now - Duration::days(5)).await;

    h.ctx.subscriptions.expire_due(now, 100).await.unwrap();

    let sub = reload(&h, sub.id).await;
    assert_eq!(sub.status, SubscriptionStatus::Expired);
    assert!(sub.grace_ends_at.is_none());
    assert_eq!(h.events.count(SUBJECT_SUBSCRIPTION_GRACE_STARTED), 0);
}

#[tokio::test]
async fn test_without_grace_subscriptions_expire_directly() {
    let h = harness_with(|c| c.subscription_grace = None);
    let now = Utc::now();
    let sub = subscription(&h, now - Duration::hours(1)).await;

    h.ctx.subscriptions.expire_due(now, 100).await.unwrap();

    assert_eq!(reload(&h, sub.id).await.status, SubscriptionStatus::Expired);
}

#[tokio::test]
async fn test_expire_due_drains_multiple_batches() {
    let h = harness();
    let now = Utc::now();
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(subscription(&h, now - Duration::hours(1)).await.id);
    }

    let transitions = h.ctx.subscriptions.expire_due(now, 2).await.unwrap();
    assert_eq!(transitions, 5);
    for id in ids {
        assert_eq!(reload(&h, id).await.status, SubscriptionStatus::Grace);
    }
}

#[tokio::test]
async fn test_cancel_at_period_end() {
    let h = harness();
    let now = Utc::now();
    let sub = subscription(&h, now + Duration::days(10)).await;

    let sub = h.ctx.subscriptions.cancel(sub.id, false).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(!sub.auto_renews);
    assert_eq!(sub.metadata.get(CANCEL_AT_PERIOD_END_KEY), Some(&json!(true)));

    // Nothing happens before the period ends
    assert_eq!(h.ctx.subscriptions.expire_due(now, 100).await.unwrap(), 0);

    h.ctx
        .subscriptions
        .expire_due(now + Duration::days(11), 100)
        .await
        .unwrap();
    let sub = reload(&h, sub.id).await;
    assert_eq!(sub.status, SubscriptionStatus::Cancelled);
    assert!(sub.cancelled_at.is_some());
}

#[tokio::test]
async fn test_immediate_cancel_is_terminal_and_repeatable() {
    let h = harness();
    let sub = subscription(&h, Utc::now() + Duration::days(10)).await;

    let cancelled = h.ctx.subscriptions.cancel(sub.id, true).await.unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);

    let again = h.ctx.subscriptions.cancel(sub.id, true).await.unwrap();
    assert_eq!(again.cancelled_at, cancelled.cancelled_at);

    let err = h
        .ctx
        .subscriptions
        .renewal_succeeded(sub.id, Utc::now() + Duration::days(30))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::InvalidState(_)));
}

#[tokio::test]
async fn test_failed_renewal_then_recovery() {
    let h = harness();
    let now = Utc::now();
    let ends_at = now + Duration::hours(1);
    let sub = subscription(&h, ends_at).await;

    let sub = h.ctx.subscriptions.renewal_failed(sub.id, now).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Grace);
    assert_eq!(sub.grace_ends_at, Some(ends_at + Duration::days(3)));

    // A second failure notice keeps the original window
    let repeat = h.ctx.subscriptions.renewal_failed(sub.id, now).await.unwrap();
    assert_eq!(repeat.grace_ends_at, sub.grace_ends_at);
    assert_eq!(h.events.count(SUBJECT_SUBSCRIPTION_GRACE_STARTED), 1);

    let new_end = now + Duration::days(30);
    let renewed = h
        .ctx
        .subscriptions
        .renewal_succeeded(sub.id, new_end)
        .await
        .unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.ends_at, new_end);
    assert!(renewed.grace_ends_at.is_none());
}

#[tokio::test]
async fn test_missing_subscription_is_not_found() {
    let h = harness();
    let err = h
        .ctx
        .subscriptions
        .expire(Uuid::new_v4(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::NotFound(_)));
}

// ============================================================================
// Renewal reminders
// ============================================================================

#[tokio::test]
async fn test_reminder_sent_once_per_period() {
    let h = harness();
    let now = Utc::now();
    let due_soon = subscription(&h, now + Duration::hours(24)).await;
    let far_off = subscription(&h, now + Duration::hours(72)).await;

    assert_eq!(h.ctx.subscriptions.send_renewal_reminders(now, 100).await.unwrap(), 1);
    assert_eq!(h.ctx.subscriptions.send_renewal_reminders(now, 100).await.unwrap(), 0);
    assert_eq!(h.events.count(SUBJECT_SUBSCRIPTION_REMINDER), 1);

    let due_soon = reload(&h, due_soon.id).await;
    assert_eq!(due_soon.last_reminded_period_end(), Some(due_soon.ends_at));
    assert_eq!(due_soon.metadata.get(REMINDER_GRACE_KEY), Some(&json!(false)));
    assert!(reload(&h, far_off.id).await.last_reminded_period_end().is_none());

    // A new period gets its own reminder
    h.ctx
        .subscriptions
        .renewal_succeeded(due_soon.id, now + Duration::hours(30))
        .await
        .unwrap();
    assert_eq!(h.ctx.subscriptions.send_renewal_reminders(now, 100).await.unwrap(), 1);
}

#[tokio::test]
async fn test_reminders_page_past_already_reminded_subscriptions() {
    let h = harness();
    let now = Utc::now();
    let first = subscription(&h, now + Duration::hours(10)).await;
    let second = subscription(&h, now + Duration::hours(20)).await;
    let third = subscription(&h, now + Duration::hours(30)).await;

    let mut sent = Vec::new();
    for _ in 0..5 {
        sent.push(h.ctx.subscriptions.send_renewal_reminders(now, 1).await.unwrap());
    }

    assert_eq!(sent, vec![1, 1, 1, 0, 0]);
    assert_eq!(h.events.count(SUBJECT_SUBSCRIPTION_REMINDER), 3);
    for sub in [first, second, third] {
        let sub = reload(&h, sub.id).await;
        assert_eq!(sub.last_reminded_period_end(), Some(sub.ends_at));
    }
}

#[tokio::test]
async fn test_no_reminder_for_non_renewing_subscription() {
    let h = harness();
    let now = Utc::now();
    let sub = subscription(&h, now + Duration::hours(12)).await;
    h.ctx.subscriptions.cancel(sub.id, false).await.unwrap();

    assert_eq!(h.ctx.subscriptions.send_renewal_reminders(now, 100).await.unwrap(), 0);
}

#[tokio::test]
async fn test_grace_reminder() {
    let h = harness_with(|c| c.subscription_grace = Some(Duration::hours(24)));
    let now = Utc::now();
    let sub = subscription(&h, now - Duration::hours(1)).await;
    h.ctx.subscriptions.expire_due(now, 100).await.unwrap();

    assert_eq!(h.ctx.subscriptions.send_renewal_reminders(now, 100).await.unwrap(), 1);
    let sub = reload(&h, sub.id).await;
    assert_eq!(sub.status, SubscriptionStatus::Grace);
    assert_eq!(sub.metadata.get(REMINDER_GRACE_KEY), Some(&json!(true)));
}

// ============================================================================
// Retention cleanup
// ============================================================================

#[tokio::test]
async fn test_cleanup_removes_old_abandoned_records_only() {
    let h = harness();
    let abandoned = h.create_intent(100).await;
    h.ctx
        .payments
        .cancel_intent(abandoned.id, Some("abandoned".to_string()))
        .await
        .unwrap();
    let open = h.create_intent(100).await;
    let (_, captured) = h.captured_payment(100).await;

    let later = Utc::now() + Duration::days(91);
    let summary = h
        .ctx
        .cleanup
        .cleanup_stale(later, h.config.intent_retention, 100)
        .await
        .unwrap();

    // The cancelled and succeeded intents go; their uncaptured payment too
    assert_eq!(summary.intents_deleted, 2);
    assert_eq!(summary.payments_deleted, 1);

    assert!(h.store.get_intent(abandoned.id).await.unwrap().is_none());
    assert!(h.store.get_payment(abandoned.payment_id.unwrap()).await.unwrap().is_none());
    assert!(h.store.get_intent(open.id).await.unwrap().is_some());
    assert!(h.store.get_payment(open.payment_id.unwrap()).await.unwrap().is_some());
    assert!(h.store.get_payment(captured.id).await.unwrap().is_some());
    assert_eq!(h.ledger(captured.id).await.len(), 2);
}

#[tokio::test]
async fn test_cleanup_respects_retention() {
    let h = harness();
    let intent = h.create_intent(100).await;
    h.ctx.payments.cancel_intent(intent.id, None).await.unwrap();

    let summary = h
        .ctx
        .cleanup
        .cleanup_stale(Utc::now(), h.config.intent_retention, 100)
        .await
        .unwrap();

    assert_eq!(summary.intents_deleted, 0);
    assert_eq!(summary.payments_deleted, 0);
    assert!(h.store.get_intent(intent.id).await.unwrap().is_some());
}
