use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Metadata, UnknownVariant};
use crate::money::Money;

/// Intent lifecycle
///
/// ```text
/// Pending -> RequiresMethod -> RequiresConfirmation -> Processing -> Succeeded
///                                                              \--> Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    RequiresMethod,
    RequiresConfirmation,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::RequiresMethod => "requires_method",
            IntentStatus::RequiresConfirmation => "requires_confirmation",
            IntentStatus::Processing => "processing",
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Failed => "failed",
            IntentStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "requires_method" => Ok(IntentStatus::RequiresMethod),
            "requires_confirmation" => Ok(IntentStatus::RequiresConfirmation),
            "processing" => Ok(IntentStatus::Processing),
            "succeeded" => Ok(IntentStatus::Succeeded),
            "failed" => Ok(IntentStatus::Failed),
            "cancelled" => Ok(IntentStatus::Cancelled),
            other => Err(UnknownVariant::new("intent status", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Succeeded | IntentStatus::Failed | IntentStatus::Cancelled
        )
    }

    /// Statuses the expiry sweep may cancel once `expires_at` has passed
    pub const EXPIRABLE: [IntentStatus; 4] = [
        IntentStatus::Pending,
        IntentStatus::RequiresMethod,
        IntentStatus::RequiresConfirmation,
        IntentStatus::Processing,
    ];

    pub const TERMINAL: [IntentStatus; 3] = [
        IntentStatus::Succeeded,
        IntentStatus::Failed,
        IntentStatus::Cancelled,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    OneTime,
    Recurring,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::OneTime => "one_time",
            PaymentType::Recurring => "recurring",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "one_time" => Ok(PaymentType::OneTime),
            "recurring" => Ok(PaymentType::Recurring),
            other => Err(UnknownVariant::new("payment type", other)),
        }
    }
}

/// One attempt to collect funds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub uuid: Uuid,
    pub provider: String,
    pub provider_intent_id: Option<String>,
    pub amount: Money,
    pub payer_id: i64,
    pub payee_id: Option<i64>,
    pub payment_type: PaymentType,
    pub method: String,
    pub status: IntentStatus,
    pub metadata: Metadata,
    /// Linked Payment, set at creation (or on capture for intents created without one)
    pub payment_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub succeeded_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl PaymentIntent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.expires_at.is_some_and(|at| at <= now)
    }
}
