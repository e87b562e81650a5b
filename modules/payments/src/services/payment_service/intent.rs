use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::{
    apply_capture, ensure_positive, lock_intent_or_missing, lock_payment_or_missing, set_reason,
    CaptureData, CreateIntentRequest, PaymentService,
};
use crate::error::PaymentError;
use crate::events::{publish_all, PaymentEvent};
use crate::gateway::{idempotency_key, AuthorizationStatus, AuthorizeRequest, GatewayError};
use crate::models::{IntentStatus, Payment, PaymentIntent, PaymentStatus};

impl PaymentService {
    /// Authorize with the selected gateway and persist the intent together
    /// with its pending payment.
    ///
    /// Nothing is persisted when the gateway rejects the authorization.
    pub async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<PaymentIntent, PaymentError> {
        ensure_positive(&request.amount)?;

        let gateway = request
            .gateway
            .clone()
            .unwrap_or_else(|| self.gateways.default_driver().to_string());
        let driver = self.driver(&gateway)?;
        let (fee_amount, net_amount) = self.split_fee(&request.amount)?;

        let intent_uuid = Uuid::new_v4();
        let authorization = driver
            .authorize(&AuthorizeRequest {
                intent_uuid,
                amount: request.amount,
                payer_id: request.payer_id,
                payee_id: request.payee_id,
                method: request.method.clone(),
                metadata: request.metadata.clone(),
                idempotency_key: idempotency_key(intent_uuid, "authorize"),
            })
            .await?;

        let status = match authorization.status {
            AuthorizationStatus::Pending => IntentStatus::Pending,
            AuthorizationStatus::RequiresMethod => IntentStatus::RequiresMethod,
            AuthorizationStatus::RequiresConfirmation => IntentStatus::RequiresConfirmation,
        };

        let now = Utc::now();
        let mut metadata = request.metadata.clone();
        if let Some(url) = &authorization.redirect_url {
            metadata.insert("redirect_url".to_string(), Value::String(url.clone()));
        }

        let payment = Payment {
            id: Uuid::new_v4(),
            uuid: Uuid::new_v4(),
            intent_id: None,
            payable: request.payable,
            payer_id: Some(request.payer_id),
            payee_id: request.payee_id,
            payment_type: request.payment_type,
            status: PaymentStatus::Pending,
            amount: request.amount,
            fee_amount,
            net_amount,
            method: request.method.clone(),
            provider: gateway.clone(),
            provider_payment_id: Some(authorization.provider_ref.clone()),
            payment_method_id: request.payment_method_id,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            authorized_at: None,
            captured_at: None,
            succeeded_at: None,
            settled_at: None,
            refunded_at: None,
            cancelled_at: None,
            failed_at: None,
        };

        let intent = PaymentIntent {
            id: Uuid::new_v4(),
            uuid: intent_uuid,
            provider: gateway,
            provider_intent_id: Some(authorization.provider_ref),
            amount: request.amount,
            payer_id: request.payer_id,
            payee_id: request.payee_id,
            payment_type: request.payment_type,
            method: request.method,
            status,
            metadata,
            payment_id: Some(payment.id),
            expires_at: Some(request.expires_at.unwrap_or(now + self.intent_ttl)),
            created_at: now,
            updated_at: now,
            succeeded_at: None,
            failed_at: None,
            cancelled_at: None,
        };
        let payment = Payment {
            intent_id: Some(intent.id),
            ..payment
        };

        let mut tx = self.store.begin().await?;
        tx.insert_payment(&payment).await?;
        tx.insert_intent(&intent).await?;
        tx.commit().await?;

        tracing::info!(
            intent_id = %intent.id,
            payment_id = %payment.id,
            provider = %intent.provider,
            amount = %intent.amount,
            status = intent.status.as_str(),
            "Payment intent created"
        );

        Ok(intent)
    }

    /// Confirm an intent the caller has nothing more to say about
    pub async fn confirm(&self, intent_id: Uuid) -> Result<Payment, PaymentError> {
        self.capture(intent_id, CaptureData::default()).await
    }

    /// Capture an intent through its gateway and settle the linked payment.
    ///
    /// An already-succeeded intent returns its payment without side effects.
    /// `GatewayUnavailable` leaves the intent in `Processing`; a retry reuses
    /// the same idempotency key. A decline fails the intent.
    pub async fn capture(&self, intent_id: Uuid, data: CaptureData) -> Result<Payment, PaymentError> {
        // Move to Processing under lock
        let mut tx = self.store.begin().await?;
        let mut intent = lock_intent_or_missing(tx.as_mut(), intent_id).await?;

        if intent.is_terminal() {
            let payment = match (intent.status, intent.payment_id) {
                (IntentStatus::Succeeded, Some(payment_id)) => {
                    lock_payment_or_missing(tx.as_mut(), payment_id).await?
                }
                _ => {
                    return Err(PaymentError::InvalidState(format!(
                        "intent {} is {}",
                        intent.id,
                        intent.status.as_str()
                    )))
                }
            };
            tx.rollback().await?;
            tracing::info!(intent_id = %intent.id, "Intent already captured, skipping");
            return Ok(payment);
        }

        validate_capture(&intent, &data)?;
        let provider_ref = intent.provider_intent_id.clone().ok_or_else(|| {
            PaymentError::InvalidState(format!("intent {} has no provider reference", intent.id))
        })?;

        if intent.status != IntentStatus::Processing {
            intent.status = IntentStatus::Processing;
            intent.updated_at = Utc::now();
            tx.update_intent(&intent).await?;
        }
        tx.commit().await?;

        // Gateway round trip, outside any transaction
        let driver = self.driver(&intent.provider)?;
        let captured = match driver
            .capture(
                &provider_ref,
                intent.amount,
                &idempotency_key(intent.uuid, "capture"),
            )
            .await
        {
            Ok(result) => result,
            Err(GatewayError::Declined(reason)) => {
                tracing::warn!(intent_id = %intent.id, reason = %reason, "Capture declined");
                self.fail(intent.id, Some(reason.clone())).await?;
                return Err(PaymentError::GatewayDeclined(reason));
            }
            Err(e) => {
                tracing::error!(intent_id = %intent.id, error = %e, "Capture did not complete");
                return Err(e.into());
            }
        };

        let data = CaptureData {
            provider_intent_id: Some(captured.provider_ref),
            amount: Some(captured.amount),
            charge_ref: captured.charge_ref.or(data.charge_ref),
        };

        // Finalize intent and payment together
        let mut tx = self.store.begin().await?;
        let mut intent = lock_intent_or_missing(tx.as_mut(), intent_id).await?;
        let payment_id = intent.payment_id.ok_or_else(|| {
            PaymentError::InvalidState(format!("intent {} has no linked payment", intent.id))
        })?;
        let mut payment = lock_payment_or_missing(tx.as_mut(), payment_id).await?;

        if intent.is_terminal() {
            // A webhook finished the job while the gateway call was in flight
            tx.rollback().await?;
            if intent.status == IntentStatus::Succeeded {
                return Ok(payment);
            }
            return Err(PaymentError::InvalidState(format!(
                "intent {} is {}",
                intent.id,
                intent.status.as_str()
            )));
        }

        let now = Utc::now();
        let mut events = Vec::with_capacity(2);
        if !payment.status.is_captured() {
            if !payment.status.is_open() {
                return Err(PaymentError::InvalidState(format!(
                    "payment {} is {}",
                    payment.id,
                    payment.status.as_str()
                )));
            }
            apply_capture(&mut payment, &data, now);
            tx.update_payment(&payment).await?;
            events.push(PaymentEvent::PaymentCaptured {
                payment: payment.clone(),
            });
        }

        intent.status = IntentStatus::Succeeded;
        intent.succeeded_at.get_or_insert(now);
        intent.updated_at = now;
        tx.update_intent(&intent).await?;
        tx.commit().await?;

        tracing::info!(
            intent_id = %intent.id,
            payment_id = %payment.id,
            amount = %payment.amount,
            "Payment captured"
        );

        events.insert(0, PaymentEvent::PaymentIntentSucceeded { intent });
        publish_all(&self.bus, events).await;
        Ok(payment)
    }

    /// Fail an intent and its open payment. Terminal intents are returned
    /// unchanged.
    pub async fn fail(
        &self,
        intent_id: Uuid,
        reason: Option<String>,
    ) -> Result<PaymentIntent, PaymentError> {
        let mut tx = self.store.begin().await?;
        let mut intent = lock_intent_or_missing(tx.as_mut(), intent_id).await?;

        if intent.is_terminal() {
            tx.rollback().await?;
            tracing::info!(intent_id = %intent.id, status = intent.status.as_str(), "Intent already terminal, not failing");
            return Ok(intent);
        }

        let now = Utc::now();
        intent.status = IntentStatus::Failed;
        intent.failed_at = Some(now);
        intent.updated_at = now;
        set_reason(&mut intent.metadata, "failure_reason", reason.as_deref());
        tx.update_intent(&intent).await?;

        let mut failed_payment = None;
        if let Some(payment_id) = intent.payment_id {
            if let Some(mut payment) = tx.lock_payment(payment_id).await? {
                if payment.status.is_open() {
                    payment.status = PaymentStatus::Failed;
                    payment.failed_at = Some(now);
                    payment.updated_at = now;
                    set_reason(&mut payment.metadata, "failure_reason", reason.as_deref());
                    tx.update_payment(&payment).await?;
                    failed_payment = Some(payment);
                }
            }
        }
        tx.commit().await?;

        tracing::warn!(
            intent_id = %intent.id,
            reason = reason.as_deref().unwrap_or("unspecified"),
            "Payment intent failed"
        );

        if let Some(payment) = failed_payment {
            publish_all(
                &self.bus,
                vec![PaymentEvent::PaymentFailed {
                    payment,
                    intent: Some(intent.clone()),
                    reason,
                }],
            )
            .await;
        }
        Ok(intent)
    }

    /// Cancel a non-terminal intent on behalf of a caller. The authorization
    /// is voided at the gateway first.
    pub async fn cancel_intent(
        &self,
        intent_id: Uuid,
        reason: Option<String>,
    ) -> Result<PaymentIntent, PaymentError> {
        let current = self.get_intent(intent_id).await?;
        if current.is_terminal() {
            return Ok(current);
        }

        if let Some(provider_ref) = &current.provider_intent_id {
            self.driver(&current.provider)?.void(provider_ref).await?;
        }

        let mut tx = self.store.begin().await?;
        let mut intent = lock_intent_or_missing(tx.as_mut(), intent_id).await?;
        if intent.is_terminal() {
            tx.rollback().await?;
            return Ok(intent);
        }

        let now = Utc::now();
        intent.status = IntentStatus::Cancelled;
        intent.cancelled_at = Some(now);
        intent.updated_at = now;
        set_reason(&mut intent.metadata, "cancellation_reason", reason.as_deref());
        tx.update_intent(&intent).await?;

        let mut events = vec![PaymentEvent::PaymentIntentCancelled {
            intent: intent.clone(),
            expired: false,
        }];
        if let Some(payment_id) = intent.payment_id {
            if let Some(mut payment) = tx.lock_payment(payment_id).await? {
                if payment.status.is_open() {
                    payment.status = PaymentStatus::Cancelled;
                    payment.cancelled_at = Some(now);
                    payment.updated_at = now;
                    tx.update_payment(&payment).await?;
                    events.push(PaymentEvent::PaymentCancelled { payment });
                }
            }
        }
        tx.commit().await?;

        tracing::info!(intent_id = %intent.id, "Payment intent cancelled");
        publish_all(&self.bus, events).await;
        Ok(intent)
    }
}

fn validate_capture(intent: &PaymentIntent, data: &CaptureData) -> Result<(), PaymentError> {
    if let Some(reported) = &data.provider_intent_id {
        if intent.provider_intent_id.as_deref() != Some(reported.as_str()) {
            return Err(PaymentError::InvalidState(format!(
                "provider intent {} does not belong to intent {}",
                reported, intent.id
            )));
        }
    }
    if let Some(amount) = &data.amount {
        amount.ensure_same_currency(&intent.amount)?;
        if amount.amount_minor != intent.amount.amount_minor {
            return Err(PaymentError::InvalidAmount(format!(
                "capture amount {} differs from intent amount {}",
                amount, intent.amount
            )));
        }
    }
    Ok(())
}
