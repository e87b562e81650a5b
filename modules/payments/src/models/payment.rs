use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Metadata, Payable, PaymentType, UnknownVariant};
use crate::money::{Currency, Money};

/// Payment lifecycle
///
/// `Pending -> Authorized -> Captured -> Settled`, `Captured | Settled -> Refunded`,
/// and any non-terminal status may move to `Cancelled` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Captured,
    Settled,
    Refunded,
    Cancelled,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Captured => "captured",
            PaymentStatus::Settled => "settled",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "authorized" => Ok(PaymentStatus::Authorized),
            "captured" => Ok(PaymentStatus::Captured),
            "settled" => Ok(PaymentStatus::Settled),
            "refunded" => Ok(PaymentStatus::Refunded),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(UnknownVariant::new("payment status", other)),
        }
    }

    /// Money has moved; the payment can only be settled or refunded from here
    pub fn is_captured(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Captured | PaymentStatus::Settled | PaymentStatus::Refunded
        )
    }

    /// Not yet captured and not closed
    pub fn is_open(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Authorized)
    }

    pub fn is_refundable(&self) -> bool {
        matches!(self, PaymentStatus::Captured | PaymentStatus::Settled)
    }
}

/// A settled-or-settling transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub uuid: Uuid,
    pub intent_id: Option<Uuid>,
    pub payable: Payable,
    pub payer_id: Option<i64>,
    pub payee_id: Option<i64>,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub amount: Money,
    pub fee_amount: Money,
    pub net_amount: Money,
    pub method: String,
    pub provider: String,
    pub provider_payment_id: Option<String>,
    pub payment_method_id: Option<Uuid>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub succeeded_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn currency(&self) -> Currency {
        self.amount.currency
    }

    /// `net = amount - fee`, `0 <= fee <= amount`, one currency throughout
    pub fn amounts_consistent(&self) -> bool {
        self.fee_amount.currency == self.amount.currency
            && self.net_amount.currency == self.amount.currency
            && self.fee_amount.amount_minor >= 0
            && self.fee_amount.amount_minor <= self.amount.amount_minor
            && self.amount.amount_minor - self.fee_amount.amount_minor
                == self.net_amount.amount_minor
    }

    /// Reference the provider needs for refunds; webhooks may record a charge
    /// id that differs from the intent-level `provider_payment_id`.
    pub fn provider_charge_ref(&self) -> Option<&str> {
        self.metadata
            .get("provider_charge_ref")
            .and_then(|v| v.as_str())
            .or(self.provider_payment_id.as_deref())
    }
}
