use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Metadata, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Processed => "processed",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "pending" => Ok(WebhookStatus::Pending),
            "processed" => Ok(WebhookStatus::Processed),
            "failed" => Ok(WebhookStatus::Failed),
            other => Err(UnknownVariant::new("webhook status", other)),
        }
    }
}

/// Raw inbound provider event, retained for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentWebhook {
    pub id: Uuid,
    pub provider: String,
    /// Provider event id, used for duplicate-delivery detection
    pub event_id: Option<String>,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub signature: Option<String>,
    pub status: WebhookStatus,
    pub attempts: i32,
    pub metadata: Metadata,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}
