//! Vaulted payment methods
//!
//! A user has at most one default method. The first method vaulted for a user
//! becomes the default; deleting the default does not promote another one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::PaymentError;
use crate::gateway::PaymentGatewayManager;
use crate::models::PaymentMethod;
use crate::store::{PaymentStore, StoreTx};

pub struct PaymentMethodService {
    store: Arc<dyn PaymentStore>,
    gateways: Arc<PaymentGatewayManager>,
}

impl PaymentMethodService {
    pub fn new(store: Arc<dyn PaymentStore>, gateways: Arc<PaymentGatewayManager>) -> Self {
        Self { store, gateways }
    }

    /// Exchange a raw provider token for a stored method. Vaulting the same
    /// provider method twice returns the existing record.
    pub async fn vault(
        &self,
        user_id: i64,
        gateway: Option<&str>,
        raw_token: &str,
    ) -> Result<PaymentMethod, PaymentError> {
        let name = gateway.unwrap_or(self.gateways.default_driver());
        let driver = self
            .gateways
            .driver(name)
            .ok_or_else(|| PaymentError::GatewayResolution(name.to_string()))?;

        let descriptor = driver.vault_token(raw_token).await?;

        let mut tx = self.store.begin().await?;
        let existing = tx.lock_payment_methods_for_user(user_id).await?;

        if let Some(method) = existing.iter().find(|m| {
            m.provider == driver.name() && m.provider_method_id == descriptor.provider_method_id
        }) {
            tx.rollback().await?;
            return Ok(method.clone());
        }

        let now = Utc::now();
        let method = PaymentMethod {
            id: Uuid::new_v4(),
            user_id,
            provider: driver.name().to_string(),
            provider_method_id: descriptor.provider_method_id,
            brand: descriptor.brand,
            last_four: descriptor.last_four,
            exp_month: descriptor.exp_month,
            exp_year: descriptor.exp_year,
            is_default: existing.is_empty(),
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        tx.insert_payment_method(&method).await?;
        tx.commit().await?;

        tracing::info!(
            user_id,
            method_id = %method.id,
            provider = %method.provider,
            is_default = method.is_default,
            "Payment method vaulted"
        );
        Ok(method)
    }

    /// Make one method the user's default, clearing the previous default
    pub async fn set_default(
        &self,
        user_id: i64,
        method_id: Uuid,
    ) -> Result<PaymentMethod, PaymentError> {
        let mut tx = self.store.begin().await?;
        let methods = tx.lock_payment_methods_for_user(user_id).await?;

        let Some(mut target) = methods.iter().find(|m| m.id == method_id).cloned() else {
            tx.rollback().await?;
            return Err(missing(user_id, method_id));
        };
        if target.is_default {
            tx.rollback().await?;
            return Ok(target);
        }

        let now = Utc::now();
        // Clear first so the one-default-per-user index never sees two
        for mut other in methods.into_iter().filter(|m| m.is_default) {
            other.is_default = false;
            other.updated_at = now;
            tx.update_payment_method(&other).await?;
        }

        target.is_default = true;
        target.updated_at = now;
        tx.update_payment_method(&target).await?;
        tx.commit().await?;

        tracing::info!(user_id, method_id = %method_id, "Default payment method changed");
        Ok(target)
    }

    /// Remove a method. Payments that referenced it keep their history with
    /// the reference cleared.
    pub async fn delete(&self, user_id: i64, method_id: Uuid) -> Result<(), PaymentError> {
        let mut tx = self.store.begin().await?;
        owned_method(tx.as_mut(), user_id, method_id).await?;

        tx.delete_payment_method(method_id).await?;
        tx.commit().await?;

        tracing::info!(user_id, method_id = %method_id, "Payment method deleted");
        Ok(())
    }

    pub async fn mark_used(
        &self,
        user_id: i64,
        method_id: Uuid,
        used_at: DateTime<Utc>,
    ) -> Result<PaymentMethod, PaymentError> {
        let mut tx = self.store.begin().await?;
        let mut method = owned_method(tx.as_mut(), user_id, method_id).await?;

        method.last_used_at = Some(used_at);
        method.updated_at = used_at;
        tx.update_payment_method(&method).await?;
        tx.commit().await?;
        Ok(method)
    }

    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<PaymentMethod>, PaymentError> {
        Ok(self.store.list_payment_methods(user_id).await?)
    }
}

async fn owned_method(
    tx: &mut dyn StoreTx,
    user_id: i64,
    method_id: Uuid,
) -> Result<PaymentMethod, PaymentError> {
    tx.lock_payment_methods_for_user(user_id)
        .await?
        .into_iter()
        .find(|m| m.id == method_id)
        .ok_or_else(|| missing(user_id, method_id))
}

fn missing(user_id: i64, method_id: Uuid) -> PaymentError {
    PaymentError::NotFound(format!("payment method {} for user {}", method_id, user_id))
}
