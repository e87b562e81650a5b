use chrono::Utc;
use event_bus::consumer_retry::retry_with_backoff_if;
use uuid::Uuid;

use super::{lock_payment_or_missing, PaymentService, RefundData};
use crate::error::PaymentError;
use crate::events::{publish_all, PaymentEvent};
use crate::gateway::idempotency_key;
use crate::models::{Payment, PaymentStatus, Refund, RefundStatus};
use crate::money::Money;
use crate::store::StoreTx;

/// Result of recording a gateway-executed refund
enum Finalized {
    Completed(Payment, Refund),
    /// The provider's refund webhook got there first
    AlreadySettled(Refund),
}

impl PaymentService {
    /// Refund part or all of a captured payment.
    ///
    /// 1. Under the payment lock, reserve a `Pending` refund against the
    ///    remaining balance (`amount - pending - succeeded`)
    /// 2. Execute it at the gateway, unless the provider already did
    /// 3. Mark it `Succeeded`; the payment becomes `Refunded` once the
    ///    succeeded refunds cover the full amount
    ///
    /// A gateway failure marks the reservation `Failed`, releasing it.
    ///
    /// A provider refund webhook whose id is unknown adopts the oldest
    /// matching refund still missing a provider id, so a refund started here
    /// is not recorded twice when the processor reports it later. A refund the
    /// gateway executed but that could not be recorded stays `Pending` until
    /// that webhook arrives.
    pub async fn refund(&self, payment_id: Uuid, data: RefundData) -> Result<Refund, PaymentError> {
        let mut tx = self.store.begin().await?;
        let payment = lock_payment_or_missing(tx.as_mut(), payment_id).await?;
        let refunds = tx.refunds_for_payment(payment.id).await?;

        if let Some(provider_refund_id) = &data.provider_refund_id {
            if let Some(existing) = refunds
                .iter()
                .find(|r| r.provider_refund_id.as_ref() == Some(provider_refund_id))
            {
                tx.rollback().await?;
                tracing::info!(
                    payment_id = %payment.id,
                    provider_refund_id = %provider_refund_id,
                    "Refund already recorded, skipping"
                );
                return Ok(existing.clone());
            }

            if let Some(unconfirmed) = refunds
                .iter()
                .filter(|r| awaits_provider_id(r, data.amount.as_ref()))
                .min_by_key(|r| r.created_at)
                .cloned()
            {
                return self
                    .adopt_refund(tx, payment, unconfirmed, provider_refund_id.clone())
                    .await;
            }
        }

        if !payment.status.is_refundable() {
            return Err(PaymentError::InvalidState(format!(
                "cannot refund payment {} in status {}",
                payment.id,
                payment.status.as_str()
            )));
        }

        let reserved = Money::sum(
            payment.currency(),
            refunds
                .iter()
                .filter(|r| r.status.counts_against_balance())
                .map(|r| &r.amount),
        )?;
        let refundable = payment.amount.checked_sub(&reserved)?;
        let amount = data.amount.unwrap_or(refundable);
        amount.ensure_same_currency(&payment.amount)?;
        if !amount.is_positive() {
            return Err(PaymentError::InvalidAmount(format!(
                "refund amount must be positive, got {}",
                amount
            )));
        }
        if amount.amount_minor > refundable.amount_minor {
            return Err(PaymentError::RefundExceedsCaptured {
                requested: amount.amount_minor,
                refundable: refundable.amount_minor,
            });
        }

        let now = Utc::now();
        let refund = Refund {
            id: Uuid::new_v4(),
            uuid: Uuid::new_v4(),
            payment_id: payment.id,
            amount,
            reason: data.reason.clone(),
            status: RefundStatus::Pending,
            provider_refund_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            refunded_at: None,
        };
        tx.insert_refund(&refund).await?;

        // Provider already moved the money; settle in the same transaction
        if let Some(provider_refund_id) = data.provider_refund_id {
            let (payment, refund) =
                complete_refund(tx.as_mut(), payment, refund, Some(provider_refund_id)).await?;
            tx.commit().await?;
            return Ok(self.announce_refund(payment, refund).await);
        }
        tx.commit().await?;

        let outcome = match self.driver(&payment.provider) {
            Ok(driver) => match payment.provider_charge_ref() {
                Some(charge_ref) => driver
                    .refund(
                        charge_ref,
                        amount,
                        &data.reason,
                        &idempotency_key(refund.uuid, "refund"),
                    )
                    .await
                    .map_err(PaymentError::from),
                None => Err(PaymentError::InvalidState(format!(
                    "payment {} has no provider reference",
                    payment.id
                ))),
            },
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.release_refund(refund, &e).await?;
                return Err(e);
            }
        };

        let finalized = retry_with_backoff_if(
            || self.finalize_refund(payment_id, refund.id, result.provider_refund_id.clone()),
            &self.finalize_retry,
            "refund_finalize",
            |e: &PaymentError| e.is_retryable(),
        )
        .await;

        match finalized {
            Ok(Finalized::Completed(payment, refund)) => {
                Ok(self.announce_refund(payment, refund).await)
            }
            Ok(Finalized::AlreadySettled(refund)) => Ok(refund),
            Err(e) => {
                tracing::error!(
                    refund_id = %refund.id,
                    payment_id = %payment_id,
                    provider_refund_id = ?result.provider_refund_id,
                    error = %e,
                    "Refund executed at gateway but not recorded, left pending for the provider webhook"
                );
                Err(e)
            }
        }
    }

    /// Settle a reserved refund after the gateway executed it. Reloads the
    /// refund under the payment lock since a webhook may have settled it.
    async fn finalize_refund(
        &self,
        payment_id: Uuid,
        refund_id: Uuid,
        provider_refund_id: Option<String>,
    ) -> Result<Finalized, PaymentError> {
        let mut tx = self.store.begin().await?;
        let payment = lock_payment_or_missing(tx.as_mut(), payment_id).await?;
        let refund = tx
            .refunds_for_payment(payment_id)
            .await?
            .into_iter()
            .find(|r| r.id == refund_id)
            .ok_or_else(|| PaymentError::NotFound(format!("refund {}", refund_id)))?;

        if refund.status != RefundStatus::Pending {
            tx.rollback().await?;
            return Ok(Finalized::AlreadySettled(refund));
        }

        let (payment, refund) =
            complete_refund(tx.as_mut(), payment, refund, provider_refund_id).await?;
        tx.commit().await?;
        Ok(Finalized::Completed(payment, refund))
    }

    /// Attach a provider refund id to a refund recorded without one. A still
    /// `Pending` refund is settled and announced; a settled one only gains the id.
    async fn adopt_refund(
        &self,
        mut tx: Box<dyn StoreTx>,
        payment: Payment,
        mut refund: Refund,
        provider_refund_id: String,
    ) -> Result<Refund, PaymentError> {
        tracing::info!(
            payment_id = %payment.id,
            refund_id = %refund.id,
            provider_refund_id = %provider_refund_id,
            status = refund.status.as_str(),
            "Provider refund matched to recorded refund"
        );

        if refund.status == RefundStatus::Pending {
            let (payment, refund) =
                complete_refund(tx.as_mut(), payment, refund, Some(provider_refund_id)).await?;
            tx.commit().await?;
            return Ok(self.announce_refund(payment, refund).await);
        }

        refund.provider_refund_id = Some(provider_refund_id);
        refund.updated_at = Utc::now();
        tx.update_refund(&refund).await?;
        tx.commit().await?;
        Ok(refund)
    }

    async fn release_refund(&self, mut refund: Refund, cause: &PaymentError) -> Result<(), PaymentError> {
        let mut tx = self.store.begin().await?;
        refund.status = RefundStatus::Failed;
        refund.failure_reason = Some(cause.to_string());
        refund.updated_at = Utc::now();
        tx.update_refund(&refund).await?;
        tx.commit().await?;

        tracing::warn!(
            refund_id = %refund.id,
            payment_id = %refund.payment_id,
            error = %cause,
            "Refund failed at gateway, reservation released"
        );
        Ok(())
    }

    async fn announce_refund(&self, payment: Payment, refund: Refund) -> Refund {
        tracing::info!(
            payment_id = %payment.id,
            refund_id = %refund.id,
            amount = %refund.amount,
            payment_status = payment.status.as_str(),
            "Payment refunded"
        );
        publish_all(
            &self.bus,
            vec![PaymentEvent::PaymentRefunded {
                payment,
                refund: refund.clone(),
            }],
        )
        .await;
        refund
    }
}

/// Recorded without a provider id and not released, with the reported amount
/// when the provider gave one
fn awaits_provider_id(refund: &Refund, reported: Option<&Money>) -> bool {
    refund.provider_refund_id.is_none()
        && refund.status != RefundStatus::Failed
        && reported.map_or(true, |amount| *amount == refund.amount)
}

/// Mark a reserved refund succeeded and roll the payment to `Refunded` when
/// nothing is left. Caller holds the payment lock.
async fn complete_refund(
    tx: &mut dyn StoreTx,
    mut payment: Payment,
    mut refund: Refund,
    provider_refund_id: Option<String>,
) -> Result<(Payment, Refund), PaymentError> {
    let now = Utc::now();
    refund.status = RefundStatus::Succeeded;
    if provider_refund_id.is_some() {
        refund.provider_refund_id = provider_refund_id;
    }
    refund.refunded_at = Some(now);
    refund.updated_at = now;
    tx.update_refund(&refund).await?;

    let refunds = tx.refunds_for_payment(payment.id).await?;
    let refunded = Money::sum(
        payment.currency(),
        refunds
            .iter()
            .filter(|r| r.status == RefundStatus::Succeeded)
            .map(|r| &r.amount),
    )?;

    if refunded.amount_minor >= payment.amount.amount_minor
        && payment.status != PaymentStatus::Refunded
    {
        payment.status = PaymentStatus::Refunded;
        payment.refunded_at.get_or_insert(now);
        payment.updated_at = now;
        tx.update_payment(&payment).await?;
    }

    Ok((payment, refund))
}
