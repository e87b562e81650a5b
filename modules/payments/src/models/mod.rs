//! Domain records of the payments core

pub mod intent;
pub mod ledger;
pub mod payable;
pub mod payment;
pub mod payment_method;
pub mod refund;
pub mod subscription;
pub mod webhook;

pub use intent::{IntentStatus, PaymentIntent, PaymentType};
pub use ledger::{Direction, LedgerEntry, Ledgerable, PAYMENTS_LEDGER};
pub use payable::{Payable, PayableKind};
pub use payment::{Payment, PaymentStatus};
pub use payment_method::PaymentMethod;
pub use refund::{Refund, RefundStatus};
pub use subscription::{
    PaymentSubscription, SubscriptionStatus, REMINDER_GRACE_KEY, REMINDER_PERIOD_END_KEY,
    REMINDER_SENT_AT_KEY,
};
pub use webhook::{PaymentWebhook, WebhookStatus};

use serde_json::{Map, Value};

/// Open key-value map carried by intents, payments, webhooks and subscriptions
pub type Metadata = Map<String, Value>;

/// Error for a status or tag string that does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
