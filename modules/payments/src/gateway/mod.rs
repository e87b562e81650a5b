//! Payment gateway abstraction
//!
//! Every provider driver implements [`GatewayDriver`]. Drivers own their
//! signature scheme and event vocabulary, and normalise provider webhooks into
//! the small closed set in [`WebhookEventKind`].

pub mod ccbill;
pub mod fake;
pub mod manager;
pub mod signature;
pub mod tilled;

pub use manager::PaymentGatewayManager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Metadata;
use crate::money::Money;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Provider could not be reached or answered with a server error
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("declined by provider: {0}")]
    Declined(String),

    #[error("operation not supported by {driver}: {operation}")]
    Unsupported {
        driver: String,
        operation: &'static str,
    },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("gateway configuration error: {0}")]
    Config(String),
}

/// Data a driver needs to open an authorization at the provider
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub intent_uuid: Uuid,
    pub amount: Money,
    pub payer_id: i64,
    pub payee_id: Option<i64>,
    pub method: String,
    pub metadata: Metadata,
    pub idempotency_key: String,
}

/// Intent status the driver reports after authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    /// Waiting on an out-of-band step (hosted form, 3DS, provider webhook)
    Pending,
    RequiresMethod,
    RequiresConfirmation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub provider_ref: String,
    pub status: AuthorizationStatus,
    /// Hosted payment page for redirect-based drivers
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub provider_ref: String,
    pub amount: Money,
    /// Provider charge id, when it differs from the authorization reference
    pub charge_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundResult {
    /// `None` when the processor reports the id only on its refund webhook
    pub provider_refund_id: Option<String>,
    pub amount: Money,
}

/// Card details returned when a raw token is vaulted
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub provider_method_id: String,
    pub brand: Option<String>,
    pub last_four: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventKind {
    #[serde(rename = "transaction.succeeded")]
    TransactionSucceeded,
    #[serde(rename = "transaction.failed")]
    TransactionFailed,
    #[serde(rename = "transaction.refunded")]
    TransactionRefunded,
    /// Provider event outside the core vocabulary
    #[serde(rename = "unhandled")]
    Unhandled,
}

impl WebhookEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventKind::TransactionSucceeded => "transaction.succeeded",
            WebhookEventKind::TransactionFailed => "transaction.failed",
            WebhookEventKind::TransactionRefunded => "transaction.refunded",
            WebhookEventKind::Unhandled => "unhandled",
        }
    }
}

/// Provider event normalised into the core vocabulary
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    /// Provider's unique id for this delivery
    pub event_id: String,
    pub kind: WebhookEventKind,
    /// Provider event name as received
    pub provider_event_type: String,
    /// Matches `Payment::provider_payment_id`
    pub provider_transaction_id: Option<String>,
    pub amount: Option<Money>,
    pub failure_reason: Option<String>,
    pub provider_refund_id: Option<String>,
    pub charge_ref: Option<String>,
}

impl NormalizedEvent {
    pub fn new(
        event_id: impl Into<String>,
        kind: WebhookEventKind,
        provider_event_type: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            kind,
            provider_event_type: provider_event_type.into(),
            provider_transaction_id: None,
            amount: None,
            failure_reason: None,
            provider_refund_id: None,
            charge_ref: None,
        }
    }
}

/// Capability interface implemented per provider
#[async_trait]
pub trait GatewayDriver: Send + Sync {
    fn name(&self) -> &str;

    /// HTTP header that carries the webhook signature
    fn signature_header(&self) -> &'static str;

    /// Secret used to verify inbound webhooks
    fn webhook_secret(&self) -> &str;

    async fn authorize(&self, request: &AuthorizeRequest) -> Result<Authorization, GatewayError>;

    async fn capture(
        &self,
        provider_ref: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<CaptureResult, GatewayError>;

    async fn refund(
        &self,
        provider_ref: &str,
        amount: Money,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<RefundResult, GatewayError>;

    async fn void(&self, provider_ref: &str) -> Result<(), GatewayError>;

    async fn vault_token(&self, raw_token: &str) -> Result<MethodDescriptor, GatewayError>;

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool;

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<NormalizedEvent, GatewayError>;
}

/// Idempotency key sent with a gateway call, stable across application retries
pub fn idempotency_key(entity_uuid: Uuid, operation: &str) -> String {
    format!("{}:{}", entity_uuid, operation)
}
