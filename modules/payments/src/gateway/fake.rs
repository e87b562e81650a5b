//! Deterministic in-memory gateway for development and tests
//!
//! - a method starting with `fail_` is declined at authorization
//! - a method starting with `decline_capture` authorizes but is declined at capture
//! - `hosted` authorizes into `Pending` with a redirect URL
//! - [`FakeGateway::set_unavailable`] makes every call fail with `Unavailable`
//!
//! Provider references are sequential (`fake_pi_000001`), and repeated calls
//! with the same idempotency key return the first result.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::signature::{hmac_sha256_hex, verify_body_hmac};
use super::{
    Authorization, AuthorizationStatus, AuthorizeRequest, CaptureResult, GatewayDriver,
    GatewayError, MethodDescriptor, NormalizedEvent, RefundResult, WebhookEventKind,
};
use crate::money::Money;

pub const FAKE_DRIVER: &str = "fake";
pub const FAKE_SIGNATURE_HEADER: &str = "x-fake-signature";

#[derive(Debug, Clone)]
struct FakeCharge {
    amount: Money,
    method: String,
    captured: bool,
    refunded_minor: i64,
    voided: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    seq: u64,
    unavailable: bool,
    deferred_refund_ids: bool,
    charges: HashMap<String, FakeCharge>,
    authorizations: HashMap<String, Authorization>,
    captures: HashMap<String, CaptureResult>,
    refunds: HashMap<String, RefundResult>,
    capture_calls: usize,
    refund_calls: usize,
}

impl FakeState {
    fn next_ref(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{}_{:06}", prefix, self.seq)
    }

    fn ensure_available(&self) -> Result<(), GatewayError> {
        if self.unavailable {
            return Err(GatewayError::Unavailable(
                "fake gateway set unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct FakeGateway {
    webhook_secret: String,
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget every charge, cached result and counter
    pub fn reset(&self) {
        *self.state() = FakeState::default();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Report refunds without an id, leaving it to the refund webhook
    pub fn set_deferred_refund_ids(&self, deferred: bool) {
        self.state().deferred_refund_ids = deferred;
    }

    /// Capture calls that reached the provider side, including idempotent replays
    pub fn capture_calls(&self) -> usize {
        self.state().capture_calls
    }

    pub fn refund_calls(&self) -> usize {
        self.state().refund_calls
    }

    /// Sign a webhook body the way this driver expects
    pub fn sign(&self, payload: &[u8]) -> String {
        hmac_sha256_hex(&self.webhook_secret, payload)
    }
}

#[async_trait]
impl GatewayDriver for FakeGateway {
    fn name(&self) -> &str {
        FAKE_DRIVER
    }

    fn signature_header(&self) -> &'static str {
        FAKE_SIGNATURE_HEADER
    }

    fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }

    async fn authorize(&self, request: &AuthorizeRequest) -> Result<Authorization, GatewayError> {
        let mut state = self.state();
        state.ensure_available()?;

        if let Some(existing) = state.authorizations.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        if request.method.starts_with("fail_") {
            tracing::warn!(
                intent_uuid = %request.intent_uuid,
                method = %request.method,
                "Fake authorization declined (triggered by method)"
            );
            return Err(GatewayError::Declined("card declined".to_string()));
        }

        let provider_ref = state.next_ref("fake_pi");
        let (status, redirect_url) = if request.method == "hosted" {
            (
                AuthorizationStatus::Pending,
                Some(format!("https://fake.gateway.test/checkout/{}", provider_ref)),
            )
        } else {
            (AuthorizationStatus::RequiresConfirmation, None)
        };

        state.charges.insert(
            provider_ref.clone(),
            FakeCharge {
                amount: request.amount,
                method: request.method.clone(),
                captured: false,
                refunded_minor: 0,
                voided: false,
            },
        );

        let authorization = Authorization {
            provider_ref,
            status,
            redirect_url,
        };
        state
            .authorizations
            .insert(request.idempotency_key.clone(), authorization.clone());
        Ok(authorization)
    }

    async fn capture(
        &self,
        provider_ref: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<CaptureResult, GatewayError> {
        let mut state = self.state();
        state.ensure_available()?;
        state.capture_calls += 1;

        if let Some(existing) = state.captures.get(idempotency_key) {
            return Ok(existing.clone());
        }

        let charge = state
            .charges
            .get_mut(provider_ref)
            .ok_or_else(|| GatewayError::Declined(format!("no authorization {}", provider_ref)))?;

        if charge.voided {
            return Err(GatewayError::Declined("authorization voided".to_string()));
        }
        if charge.method.starts_with("decline_capture") {
            return Err(GatewayError::Declined("insufficient funds".to_string()));
        }
        if charge.amount.currency != amount.currency
            || amount.amount_minor > charge.amount.amount_minor
        {
            return Err(GatewayError::Declined(
                "capture exceeds authorization".to_string(),
            ));
        }
        charge.captured = true;

        let result = CaptureResult {
            provider_ref: provider_ref.to_string(),
            amount,
            charge_ref: None,
        };
        state
            .captures
            .insert(idempotency_key.to_string(), result.clone());
        Ok(result)
    }

    async fn refund(
        &self,
        provider_ref: &str,
        amount: Money,
        _reason: &str,
        idempotency_key: &str,
    ) -> Result<RefundResult, GatewayError> {
        let mut state = self.state();
        state.ensure_available()?;
        state.refund_calls += 1;

        if let Some(existing) = state.refunds.get(idempotency_key) {
            return Ok(existing.clone());
        }

        let charge = state
            .charges
            .get(provider_ref)
            .cloned()
            .ok_or_else(|| GatewayError::Declined(format!("no charge {}", provider_ref)))?;

        if !charge.captured {
            return Err(GatewayError::Declined("charge not captured".to_string()));
        }
        if charge.refunded_minor + amount.amount_minor > charge.amount.amount_minor {
            return Err(GatewayError::Declined(
                "refund exceeds captured amount".to_string(),
            ));
        }

        let provider_refund_id = state.next_ref("fake_re");
        if let Some(charge) = state.charges.get_mut(provider_ref) {
            charge.refunded_minor += amount.amount_minor;
        }

        let result = RefundResult {
            provider_refund_id: (!state.deferred_refund_ids).then_some(provider_refund_id),
            amount,
        };
        state
            .refunds
            .insert(idempotency_key.to_string(), result.clone());
        Ok(result)
    }

    async fn void(&self, provider_ref: &str) -> Result<(), GatewayError> {
        let mut state = self.state();
        state.ensure_available()?;
        if let Some(charge) = state.charges.get_mut(provider_ref) {
            if charge.captured {
                return Err(GatewayError::Declined(
                    "cannot void a captured charge".to_string(),
                ));
            }
            charge.voided = true;
        }
        Ok(())
    }

    async fn vault_token(&self, raw_token: &str) -> Result<MethodDescriptor, GatewayError> {
        self.state().ensure_available()?;

        if raw_token.starts_with("tok_fail") {
            return Err(GatewayError::Declined("token rejected".to_string()));
        }

        let digits: String = raw_token.chars().filter(|c| c.is_ascii_digit()).collect();
        let last_four = if digits.len() >= 4 {
            digits[digits.len() - 4..].to_string()
        } else {
            "4242".to_string()
        };

        Ok(MethodDescriptor {
            provider_method_id: format!("fake_pm_{}", raw_token),
            brand: Some("visa".to_string()),
            last_four: Some(last_four),
            exp_month: Some(12),
            exp_year: Some(2030),
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_body_hmac(payload, signature, secret)
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<NormalizedEvent, GatewayError> {
        let body: FakeWebhookBody = serde_json::from_slice(payload)
            .map_err(|e| GatewayError::InvalidResponse(format!("fake webhook: {}", e)))?;

        let kind = match body.event_type.as_str() {
            "transaction.succeeded" => WebhookEventKind::TransactionSucceeded,
            "transaction.failed" => WebhookEventKind::TransactionFailed,
            "transaction.refunded" => WebhookEventKind::TransactionRefunded,
            _ => WebhookEventKind::Unhandled,
        };

        let amount = match (body.amount, body.currency.as_deref()) {
            (Some(amount), Some(currency)) => Some(
                Money::new(amount, currency)
                    .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?,
            ),
            _ => None,
        };

        let mut event = NormalizedEvent::new(body.id, kind, body.event_type);
        event.provider_transaction_id = body.transaction_id;
        event.amount = amount;
        event.failure_reason = body.failure_reason;
        event.provider_refund_id = body.refund_id;
        Ok(event)
    }
}

#[derive(Debug, Deserialize)]
struct FakeWebhookBody {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    transaction_id: Option<String>,
    amount: Option<i64>,
    currency: Option<String>,
    failure_reason: Option<String>,
    refund_id: Option<String>,
}
