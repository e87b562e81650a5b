use chrono::Utc;
use uuid::Uuid;

use super::{
    apply_capture, ensure_positive, lock_payment_or_missing, set_reason, CaptureData,
    PaymentService, RecordPaymentRequest,
};
use crate::error::PaymentError;
use crate::events::{publish_all, PaymentEvent};
use crate::models::{IntentStatus, Payment, PaymentIntent, PaymentStatus};
use crate::store::StoreTx;

impl PaymentService {
    /// Capture a payment the provider reports as settled (webhook path).
    ///
    /// No gateway call is made. A payment that is already captured is
    /// returned untouched, which keeps repeated deliveries harmless.
    /// A reported amount other than the payment's is rejected, which fails
    /// the webhook and leaves the payment open for review.
    pub async fn capture_payment(
        &self,
        payment_id: Uuid,
        data: CaptureData,
    ) -> Result<Payment, PaymentError> {
        let intent_id = self.get_payment(payment_id).await?.intent_id;

        let mut tx = self.store.begin().await?;
        let (mut intent, mut payment) = lock_pair(tx.as_mut(), intent_id, payment_id).await?;

        if payment.status.is_captured() {
            tx.rollback().await?;
            tracing::info!(payment_id = %payment.id, "Payment already captured, skipping");
            return Ok(payment);
        }
        if !payment.status.is_open() {
            return Err(PaymentError::InvalidState(format!(
                "payment {} is {}",
                payment.id,
                payment.status.as_str()
            )));
        }
        if let Some(amount) = &data.amount {
            amount.ensure_same_currency(&payment.amount)?;
            if amount.amount_minor != payment.amount.amount_minor {
                tx.rollback().await?;
                tracing::warn!(
                    payment_id = %payment.id,
                    reported = %amount,
                    expected = %payment.amount,
                    "Provider reported a capture amount that differs from the payment"
                );
                return Err(PaymentError::InvalidAmount(format!(
                    "provider captured {} but payment {} is for {}",
                    amount, payment.id, payment.amount
                )));
            }
        }

        let now = Utc::now();
        apply_capture(&mut payment, &data, now);
        tx.update_payment(&payment).await?;

        let mut events = Vec::with_capacity(2);
        if let Some(intent) = intent.as_mut().filter(|i| !i.is_terminal()) {
            intent.status = IntentStatus::Succeeded;
            intent.succeeded_at.get_or_insert(now);
            intent.updated_at = now;
            tx.update_intent(intent).await?;
            events.push(PaymentEvent::PaymentIntentSucceeded {
                intent: intent.clone(),
            });
        }
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.id,
            provider_payment_id = payment.provider_payment_id.as_deref().unwrap_or(""),
            amount = %payment.amount,
            "Payment captured from provider notification"
        );

        events.push(PaymentEvent::PaymentCaptured {
            payment: payment.clone(),
        });
        publish_all(&self.bus, events).await;
        Ok(payment)
    }

    /// Fail an open payment and its intent. Captured or closed payments are
    /// left alone; a late failure notice never undoes a capture.
    pub async fn fail_payment(
        &self,
        payment_id: Uuid,
        reason: Option<String>,
    ) -> Result<Payment, PaymentError> {
        let intent_id = self.get_payment(payment_id).await?.intent_id;

        let mut tx = self.store.begin().await?;
        let (mut intent, mut payment) = lock_pair(tx.as_mut(), intent_id, payment_id).await?;

        if !payment.status.is_open() {
            tx.rollback().await?;
            tracing::info!(
                payment_id = %payment.id,
                status = payment.status.as_str(),
                "Payment not open, ignoring failure"
            );
            return Ok(payment);
        }

        let now = Utc::now();
        payment.status = PaymentStatus::Failed;
        payment.failed_at = Some(now);
        payment.updated_at = now;
        set_reason(&mut payment.metadata, "failure_reason", reason.as_deref());
        tx.update_payment(&payment).await?;

        if let Some(intent) = intent.as_mut().filter(|i| !i.is_terminal()) {
            intent.status = IntentStatus::Failed;
            intent.failed_at = Some(now);
            intent.updated_at = now;
            set_reason(&mut intent.metadata, "failure_reason", reason.as_deref());
            tx.update_intent(intent).await?;
        }
        tx.commit().await?;

        tracing::warn!(
            payment_id = %payment.id,
            reason = reason.as_deref().unwrap_or("unspecified"),
            "Payment failed"
        );

        publish_all(
            &self.bus,
            vec![PaymentEvent::PaymentFailed {
                payment: payment.clone(),
                intent,
                reason,
            }],
        )
        .await;
        Ok(payment)
    }

    /// Pending -> Authorized
    pub async fn authorize_payment(&self, payment_id: Uuid) -> Result<Payment, PaymentError> {
        let mut tx = self.store.begin().await?;
        let mut payment = lock_payment_or_missing(tx.as_mut(), payment_id).await?;

        match payment.status {
            PaymentStatus::Authorized => {
                tx.rollback().await?;
                return Ok(payment);
            }
            PaymentStatus::Pending => {}
            other => {
                return Err(PaymentError::InvalidState(format!(
                    "cannot authorize payment {} in status {}",
                    payment.id,
                    other.as_str()
                )))
            }
        }

        let now = Utc::now();
        payment.status = PaymentStatus::Authorized;
        payment.authorized_at.get_or_insert(now);
        payment.updated_at = now;
        tx.update_payment(&payment).await?;
        tx.commit().await?;

        tracing::info!(payment_id = %payment.id, "Payment authorized");
        Ok(payment)
    }

    /// Captured -> Settled, once funds reach the platform account
    pub async fn settle_payment(&self, payment_id: Uuid) -> Result<Payment, PaymentError> {
        let mut tx = self.store.begin().await?;
        let mut payment = lock_payment_or_missing(tx.as_mut(), payment_id).await?;

        match payment.status {
            PaymentStatus::Settled => {
                tx.rollback().await?;
                return Ok(payment);
            }
            PaymentStatus::Captured => {}
            other => {
                return Err(PaymentError::InvalidState(format!(
                    "cannot settle payment {} in status {}",
                    payment.id,
                    other.as_str()
                )))
            }
        }

        let now = Utc::now();
        payment.status = PaymentStatus::Settled;
        payment.settled_at.get_or_insert(now);
        payment.updated_at = now;
        tx.update_payment(&payment).await?;
        tx.commit().await?;

        tracing::info!(payment_id = %payment.id, "Payment settled");
        Ok(payment)
    }

    /// Cancel an open payment. Closed payments are returned unchanged.
    pub async fn cancel_payment(&self, payment_id: Uuid) -> Result<Payment, PaymentError> {
        let mut tx = self.store.begin().await?;
        let mut payment = lock_payment_or_missing(tx.as_mut(), payment_id).await?;

        if payment.status == PaymentStatus::Cancelled {
            tx.rollback().await?;
            return Ok(payment);
        }
        if !payment.status.is_open() {
            return Err(PaymentError::InvalidState(format!(
                "cannot cancel payment {} in status {}",
                payment.id,
                payment.status.as_str()
            )));
        }

        let now = Utc::now();
        payment.status = PaymentStatus::Cancelled;
        payment.cancelled_at = Some(now);
        payment.updated_at = now;
        tx.update_payment(&payment).await?;
        tx.commit().await?;

        tracing::info!(payment_id = %payment.id, "Payment cancelled");
        publish_all(
            &self.bus,
            vec![PaymentEvent::PaymentCancelled {
                payment: payment.clone(),
            }],
        )
        .await;
        Ok(payment)
    }

    /// Create a payment directly, without an intent
    pub async fn record_payment(
        &self,
        request: RecordPaymentRequest,
    ) -> Result<Payment, PaymentError> {
        ensure_positive(&request.amount)?;
        let (fee_amount, net_amount) = self.split_fee(&request.amount)?;

        let now = Utc::now();
        let captured_at = request.captured.then_some(now);
        let payment = Payment {
            id: Uuid::new_v4(),
            uuid: Uuid::new_v4(),
            intent_id: None,
            payable: request.payable,
            payer_id: request.payer_id,
            payee_id: request.payee_id,
            payment_type: request.payment_type,
            status: if request.captured {
                PaymentStatus::Captured
            } else {
                PaymentStatus::Pending
            },
            amount: request.amount,
            fee_amount,
            net_amount,
            method: request.method,
            provider: request.provider,
            provider_payment_id: request.provider_payment_id,
            payment_method_id: None,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            authorized_at: None,
            captured_at,
            succeeded_at: captured_at,
            settled_at: None,
            refunded_at: None,
            cancelled_at: None,
            failed_at: None,
        };

        let mut tx = self.store.begin().await?;
        tx.insert_payment(&payment).await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.id,
            payable = payment.payable.kind().as_str(),
            payable_id = payment.payable.id(),
            status = payment.status.as_str(),
            "Payment recorded"
        );

        if request.captured {
            publish_all(
                &self.bus,
                vec![PaymentEvent::PaymentCaptured {
                    payment: payment.clone(),
                }],
            )
            .await;
        }
        Ok(payment)
    }
}

/// Lock a payment and, first, its intent when it has one
async fn lock_pair(
    tx: &mut dyn StoreTx,
    intent_id: Option<Uuid>,
    payment_id: Uuid,
) -> Result<(Option<PaymentIntent>, Payment), PaymentError> {
    let intent = match intent_id {
        Some(id) => tx.lock_intent(id).await?,
        None => None,
    };
    let payment = lock_payment_or_missing(tx, payment_id).await?;
    Ok((intent, payment))
}
