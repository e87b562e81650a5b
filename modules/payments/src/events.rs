//! Domain events emitted by the payments core
//!
//! Every event is published after the transaction that caused it has
//! committed, and carries the mutated records so listeners do not need to
//! query back.

use std::sync::Arc;

use event_bus::{Event, EventBus};
use serde::Serialize;

use crate::models::{Payment, PaymentIntent, PaymentSubscription, Refund};

/// Module name stamped on every envelope
pub const SOURCE_MODULE: &str = "payments";

pub const SUBJECT_INTENT_SUCCEEDED: &str = "payments.intent.succeeded";
pub const SUBJECT_INTENT_CANCELLED: &str = "payments.intent.cancelled";
pub const SUBJECT_PAYMENT_CAPTURED: &str = "payments.payment.captured";
pub const SUBJECT_PAYMENT_FAILED: &str = "payments.payment.failed";
pub const SUBJECT_PAYMENT_REFUNDED: &str = "payments.payment.refunded";
pub const SUBJECT_PAYMENT_CANCELLED: &str = "payments.payment.cancelled";
pub const SUBJECT_SUBSCRIPTION_REMINDER: &str = "payments.subscription.renewal_reminder";
pub const SUBJECT_SUBSCRIPTION_GRACE_STARTED: &str = "payments.subscription.grace_started";
pub const SUBJECT_SUBSCRIPTION_EXPIRED: &str = "payments.subscription.expired";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEvent {
    PaymentIntentSucceeded {
        intent: PaymentIntent,
    },
    PaymentIntentCancelled {
        intent: PaymentIntent,
        /// Cancelled by the expiry sweep rather than by a caller
        expired: bool,
    },
    PaymentCaptured {
        payment: Payment,
    },
    PaymentFailed {
        payment: Payment,
        intent: Option<PaymentIntent>,
        reason: Option<String>,
    },
    PaymentRefunded {
        payment: Payment,
        refund: Refund,
    },
    PaymentCancelled {
        payment: Payment,
    },
    SubscriptionRenewalReminder {
        subscription: PaymentSubscription,
        is_grace_reminder: bool,
    },
    SubscriptionGraceStarted {
        subscription: PaymentSubscription,
    },
    SubscriptionExpired {
        subscription: PaymentSubscription,
    },
}

impl Event for PaymentEvent {
    fn subject(&self) -> &'static str {
        match self {
            PaymentEvent::PaymentIntentSucceeded { .. } => SUBJECT_INTENT_SUCCEEDED,
            PaymentEvent::PaymentIntentCancelled { .. } => SUBJECT_INTENT_CANCELLED,
            PaymentEvent::PaymentCaptured { .. } => SUBJECT_PAYMENT_CAPTURED,
            PaymentEvent::PaymentFailed { .. } => SUBJECT_PAYMENT_FAILED,
            PaymentEvent::PaymentRefunded { .. } => SUBJECT_PAYMENT_REFUNDED,
            PaymentEvent::PaymentCancelled { .. } => SUBJECT_PAYMENT_CANCELLED,
            PaymentEvent::SubscriptionRenewalReminder { .. } => SUBJECT_SUBSCRIPTION_REMINDER,
            PaymentEvent::SubscriptionGraceStarted { .. } => SUBJECT_SUBSCRIPTION_GRACE_STARTED,
            PaymentEvent::SubscriptionExpired { .. } => SUBJECT_SUBSCRIPTION_EXPIRED,
        }
    }
}

pub type PaymentBus = Arc<dyn EventBus<PaymentEvent>>;

/// Publish a batch of events collected during a committed transaction.
///
/// Publishing never undoes the state change, so failures are only logged.
pub async fn publish_all(bus: &PaymentBus, events: Vec<PaymentEvent>) {
    for event in events {
        let subject = event.subject();
        if let Err(e) = bus.publish(event).await {
            tracing::error!(subject = %subject, error = %e, "Failed to publish payment event");
        }
    }
}
