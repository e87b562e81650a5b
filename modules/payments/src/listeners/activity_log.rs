//! One structured log line per payments event, under the `activity` target

use async_trait::async_trait;
use event_bus::{EventEnvelope, EventHandler, HandlerError};

use crate::events::PaymentEvent;

/// Subject pattern covering every payments event
pub const ACTIVITY_PATTERN: &str = "payments.>";

#[derive(Debug, Default, Clone, Copy)]
pub struct ActivityLog;

#[async_trait]
impl EventHandler<PaymentEvent> for ActivityLog {
    fn name(&self) -> &'static str {
        "activity_log"
    }

    async fn handle(&self, envelope: &EventEnvelope<PaymentEvent>) -> Result<(), HandlerError> {
        let (entity, entity_id, actor) = match &envelope.payload {
            PaymentEvent::PaymentIntentSucceeded { intent }
            | PaymentEvent::PaymentIntentCancelled { intent, .. } => {
                ("intent", intent.id, Some(intent.payer_id))
            }
            PaymentEvent::PaymentCaptured { payment }
            | PaymentEvent::PaymentFailed { payment, .. }
            | PaymentEvent::PaymentRefunded { payment, .. }
            | PaymentEvent::PaymentCancelled { payment } => {
                ("payment", payment.id, payment.payer_id)
            }
            PaymentEvent::SubscriptionRenewalReminder { subscription, .. }
            | PaymentEvent::SubscriptionGraceStarted { subscription }
            | PaymentEvent::SubscriptionExpired { subscription } => {
                ("subscription", subscription.id, Some(subscription.subscriber_id))
            }
        };

        tracing::info!(
            target: "activity",
            event_id = %envelope.event_id,
            subject = %envelope.subject,
            entity,
            entity_id = %entity_id,
            actor_id = ?actor,
            occurred_at = %envelope.occurred_at,
            "Payments activity"
        );
        Ok(())
    }
}
