//! Payment service
//!
//! Owns the Intent and Payment state machines and the refund sub-ledger.
//! Every transition follows the same shape:
//!
//! 1. Lock the affected rows (intent before payment, always)
//! 2. Re-check state; terminal rows are successful no-ops
//! 3. Write the transition and its cascade in one transaction
//! 4. Publish events after commit
//!
//! Gateway calls never run while a transaction is open.

mod expiry;
mod intent;
mod payment;
mod refund;

pub use expiry::{ExpirySummary, EXPIRED_BY_COMMAND_KEY};

use std::sync::Arc;

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use event_bus::consumer_retry::RetryConfig;
use serde_json::Value;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::events::PaymentBus;
use crate::gateway::{GatewayDriver, PaymentGatewayManager};
use crate::models::{Metadata, Payable, Payment, PaymentIntent, PaymentStatus, PaymentType};
use crate::money::Money;
use crate::store::{PaymentStore, StoreTx};

/// Input to [`PaymentService::create_intent`]
#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    pub payer_id: i64,
    /// `None` for platform-level charges
    pub payee_id: Option<i64>,
    pub amount: Money,
    pub payment_type: PaymentType,
    pub method: String,
    pub payable: Payable,
    pub metadata: Metadata,
    /// Driver name; the configured default when absent
    pub gateway: Option<String>,
    pub payment_method_id: Option<Uuid>,
    /// Overrides the configured intent TTL
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreateIntentRequest {
    pub fn new(payer_id: i64, amount: Money, payable: Payable) -> Self {
        Self {
            payer_id,
            payee_id: None,
            amount,
            payment_type: PaymentType::OneTime,
            method: "card".to_string(),
            payable,
            metadata: Metadata::new(),
            gateway: None,
            payment_method_id: None,
            expires_at: None,
        }
    }
}

/// Details reported by whoever confirms a capture
#[derive(Debug, Clone, Default)]
pub struct CaptureData {
    /// Must match the intent's provider reference when given
    pub provider_intent_id: Option<String>,
    /// Must equal the intent amount when given
    pub amount: Option<Money>,
    /// Provider charge id, when it differs from the intent reference
    pub charge_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundData {
    /// Remaining refundable balance when absent
    pub amount: Option<Money>,
    pub reason: String,
    /// Set when the provider already executed the refund (webhook path);
    /// the gateway is not called and the id makes the call idempotent.
    pub provider_refund_id: Option<String>,
}

impl RefundData {
    pub fn new(amount: Option<Money>, reason: impl Into<String>) -> Self {
        Self {
            amount,
            reason: reason.into(),
            provider_refund_id: None,
        }
    }
}

/// Direct payment creation for callers that collected funds elsewhere
/// (legacy backfill, manual adjustments).
#[derive(Debug, Clone)]
pub struct RecordPaymentRequest {
    pub payable: Payable,
    pub payer_id: Option<i64>,
    pub payee_id: Option<i64>,
    pub amount: Money,
    pub payment_type: PaymentType,
    pub method: String,
    pub provider: String,
    pub provider_payment_id: Option<String>,
    pub metadata: Metadata,
    /// Record as already captured (posts to the ledger) instead of pending
    pub captured: bool,
}

/// Retries for recording a refund the gateway already executed
const REFUND_FINALIZE_RETRY: RetryConfig = RetryConfig {
    max_attempts: 4,
    initial_backoff: StdDuration::from_millis(50),
    max_backoff: StdDuration::from_secs(1),
};

pub struct PaymentService {
    store: Arc<dyn PaymentStore>,
    gateways: Arc<PaymentGatewayManager>,
    bus: PaymentBus,
    fee_bps: u32,
    intent_ttl: Duration,
    finalize_retry: RetryConfig,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateways: Arc<PaymentGatewayManager>,
        bus: PaymentBus,
        fee_bps: u32,
        intent_ttl: Duration,
    ) -> Self {
        Self {
            store,
            gateways,
            bus,
            fee_bps,
            intent_ttl,
            finalize_retry: REFUND_FINALIZE_RETRY,
        }
    }

    pub fn gateways(&self) -> &PaymentGatewayManager {
        &self.gateways
    }

    pub async fn get_intent(&self, id: Uuid) -> Result<PaymentIntent, PaymentError> {
        self.store
            .get_intent(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("intent {}", id)))
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<Payment, PaymentError> {
        self.store
            .get_payment(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment {}", id)))
    }

    fn driver(&self, name: &str) -> Result<Arc<dyn GatewayDriver>, PaymentError> {
        self.gateways
            .driver(name)
            .ok_or_else(|| PaymentError::GatewayResolution(name.to_string()))
    }

    /// Platform fee and net amount for a gross amount
    fn split_fee(&self, amount: &Money) -> Result<(Money, Money), PaymentError> {
        let fee = amount.multiply_bps(self.fee_bps)?;
        let net = amount.checked_sub(&fee)?;
        Ok((fee, net))
    }
}

fn ensure_positive(amount: &Money) -> Result<(), PaymentError> {
    if !amount.is_positive() {
        return Err(PaymentError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

async fn lock_intent_or_missing(
    tx: &mut dyn StoreTx,
    id: Uuid,
) -> Result<PaymentIntent, PaymentError> {
    tx.lock_intent(id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("intent {}", id)))
}

async fn lock_payment_or_missing(
    tx: &mut dyn StoreTx,
    id: Uuid,
) -> Result<Payment, PaymentError> {
    tx.lock_payment(id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("payment {}", id)))
}

fn set_reason(metadata: &mut Metadata, key: &str, reason: Option<&str>) {
    if let Some(reason) = reason {
        metadata.insert(key.to_string(), Value::String(reason.to_string()));
    }
}

/// Mark a payment captured. Timestamps are only set the first time.
fn apply_capture(payment: &mut Payment, data: &CaptureData, now: DateTime<Utc>) {
    payment.status = PaymentStatus::Captured;
    payment.captured_at.get_or_insert(now);
    payment.succeeded_at.get_or_insert(now);
    payment.updated_at = now;
    if payment.provider_payment_id.is_none() {
        payment.provider_payment_id = data.provider_intent_id.clone();
    }
    if let Some(charge_ref) = &data.charge_ref {
        payment.metadata.insert(
            "provider_charge_ref".to_string(),
            Value::String(charge_ref.clone()),
        );
    }
}
