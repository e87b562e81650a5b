//! Card processor driver (Tilled REST API)

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::signature::{verify_timestamped, DEFAULT_TOLERANCE_SECS};
use super::{
    Authorization, AuthorizationStatus, AuthorizeRequest, CaptureResult, GatewayDriver,
    GatewayError, MethodDescriptor, NormalizedEvent, RefundResult, WebhookEventKind,
};
use crate::money::Money;

pub const TILLED_DRIVER: &str = "tilled";
pub const TILLED_SIGNATURE_HEADER: &str = "tilled-signature";

/// Configuration for the Tilled API client
#[derive(Debug, Clone)]
pub struct TilledConfig {
    pub secret_key: String,
    pub account_id: String,
    pub webhook_secret: String,
    pub sandbox: bool,
    pub base_path: String,
}

impl TilledConfig {
    pub fn new(
        secret_key: String,
        account_id: String,
        webhook_secret: String,
        sandbox: bool,
    ) -> Self {
        let base_path = if sandbox {
            "https://sandbox-api.tilled.com".to_string()
        } else {
            "https://api.tilled.com".to_string()
        };

        Self {
            secret_key,
            account_id,
            webhook_secret,
            sandbox,
            base_path,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatePaymentIntentRequest<'a> {
    amount: i64,
    currency: String,
    payment_method_types: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_method_id: Option<&'a str>,
    capture_method: &'a str,
    confirm: bool,
    metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct CaptureRequest {
    amount_to_capture: i64,
}

#[derive(Debug, Serialize)]
struct CreateRefundRequest<'a> {
    payment_intent_id: &'a str,
    amount: i64,
    currency: String,
    reason: &'a str,
}

#[derive(Debug, Deserialize)]
struct TilledPaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    charges: Vec<TilledCharge>,
}

#[derive(Debug, Deserialize)]
struct TilledCharge {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TilledRefund {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TilledPaymentMethod {
    id: String,
    card: Option<TilledCard>,
}

#[derive(Debug, Deserialize)]
struct TilledCard {
    brand: String,
    last4: String,
    exp_month: i32,
    exp_year: i32,
}

/// Tilled driver
pub struct TilledGateway {
    config: TilledConfig,
    http_client: Client,
}

impl TilledGateway {
    pub fn new(config: TilledConfig) -> Result<Self, GatewayError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_path, path);
        self.http_client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.config.secret_key))
            .header("tilled-account", &self.config.account_id)
    }

    async fn post<T: serde::de::DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<T, GatewayError> {
        let mut request = self.request(reqwest::Method::POST, path).json(body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Self::handle_response(response).await
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Self::handle_response(response).await
    }

    /// Map HTTP status to the gateway error taxonomy: 5xx and 429 are transport
    /// problems, other 4xx are declines.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| GatewayError::InvalidResponse(e.to_string()));
        }

        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());

        if status.is_server_error() || status.as_u16() == 429 {
            Err(GatewayError::Unavailable(format!(
                "status {}: {}",
                status.as_u16(),
                error_body
            )))
        } else {
            Err(GatewayError::Declined(format!(
                "status {}: {}",
                status.as_u16(),
                error_body
            )))
        }
    }
}

fn authorization_status(tilled_status: &str) -> Result<AuthorizationStatus, GatewayError> {
    match tilled_status {
        "requires_payment_method" => Ok(AuthorizationStatus::RequiresMethod),
        "requires_action" | "processing" => Ok(AuthorizationStatus::Pending),
        "requires_confirmation" | "requires_capture" => {
            Ok(AuthorizationStatus::RequiresConfirmation)
        }
        "canceled" => Err(GatewayError::Declined("payment intent canceled".to_string())),
        other => Err(GatewayError::InvalidResponse(format!(
            "unexpected payment intent status {}",
            other
        ))),
    }
}

#[async_trait]
impl GatewayDriver for TilledGateway {
    fn name(&self) -> &str {
        TILLED_DRIVER
    }

    fn signature_header(&self) -> &'static str {
        TILLED_SIGNATURE_HEADER
    }

    fn webhook_secret(&self) -> &str {
        &self.config.webhook_secret
    }

    async fn authorize(&self, request: &AuthorizeRequest) -> Result<Authorization, GatewayError> {
        let mut metadata = request.metadata.clone();
        metadata.insert(
            "intent_uuid".to_string(),
            Value::String(request.intent_uuid.to_string()),
        );

        // A `pm_` method is a vaulted card; anything else waits for a method
        let payment_method_id = request
            .method
            .starts_with("pm_")
            .then_some(request.method.as_str());

        let body = CreatePaymentIntentRequest {
            amount: request.amount.amount_minor,
            currency: request.amount.currency.as_str().to_lowercase(),
            payment_method_types: ["card"],
            payment_method_id,
            capture_method: "manual",
            confirm: payment_method_id.is_some(),
            metadata,
        };

        let intent: TilledPaymentIntent = self
            .post("/v1/payment-intents", &body, Some(&request.idempotency_key))
            .await?;

        tracing::info!(
            intent_uuid = %request.intent_uuid,
            provider_ref = %intent.id,
            tilled_status = %intent.status,
            "Tilled payment intent created"
        );

        Ok(Authorization {
            status: authorization_status(&intent.status)?,
            provider_ref: intent.id,
            redirect_url: None,
        })
    }

    async fn capture(
        &self,
        provider_ref: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<CaptureResult, GatewayError> {
        let path = format!("/v1/payment-intents/{}/capture", provider_ref);
        let intent: TilledPaymentIntent = self
            .post(
                &path,
                &CaptureRequest {
                    amount_to_capture: amount.amount_minor,
                },
                Some(idempotency_key),
            )
            .await?;

        match intent.status.as_str() {
            "succeeded" | "processing" => Ok(CaptureResult {
                provider_ref: intent.id,
                amount,
                charge_ref: intent.charges.first().map(|c| c.id.clone()),
            }),
            other => Err(GatewayError::Declined(format!(
                "capture left payment intent in {}",
                other
            ))),
        }
    }

    async fn refund(
        &self,
        provider_ref: &str,
        amount: Money,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<RefundResult, GatewayError> {
        let body = CreateRefundRequest {
            payment_intent_id: provider_ref,
            amount: amount.amount_minor,
            currency: amount.currency.as_str().to_lowercase(),
            reason,
        };
        let refund: TilledRefund = self
            .post("/v1/refunds", &body, Some(idempotency_key))
            .await?;

        Ok(RefundResult {
            provider_refund_id: Some(refund.id),
            amount,
        })
    }

    async fn void(&self, provider_ref: &str) -> Result<(), GatewayError> {
        let path = format!("/v1/payment-intents/{}/cancel", provider_ref);
        let _: TilledPaymentIntent = self.post(&path, &serde_json::json!({}), None).await?;
        Ok(())
    }

    async fn vault_token(&self, raw_token: &str) -> Result<MethodDescriptor, GatewayError> {
        let path = format!("/v1/payment-methods/{}", raw_token);
        let method: TilledPaymentMethod = self.get(&path).await?;

        Ok(MethodDescriptor {
            provider_method_id: method.id,
            brand: method.card.as_ref().map(|c| c.brand.clone()),
            last_four: method.card.as_ref().map(|c| c.last4.clone()),
            exp_month: method.card.as_ref().map(|c| c.exp_month),
            exp_year: method.card.as_ref().map(|c| c.exp_year),
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_timestamped(
            payload,
            signature,
            secret,
            DEFAULT_TOLERANCE_SECS,
            chrono::Utc::now().timestamp(),
        )
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<NormalizedEvent, GatewayError> {
        parse_tilled_event(payload)
    }
}

#[derive(Debug, Deserialize)]
struct TilledWebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: Value,
}

/// Normalise a Tilled webhook body. `data` is either the object itself or
/// `{ "object": ... }`.
fn parse_tilled_event(payload: &[u8]) -> Result<NormalizedEvent, GatewayError> {
    let event: TilledWebhookEvent = serde_json::from_slice(payload)
        .map_err(|e| GatewayError::InvalidResponse(format!("tilled webhook: {}", e)))?;

    let object = event.data.get("object").unwrap_or(&event.data);
    let str_field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);
    let money_field = |v: &Value, key: &str| -> Option<Money> {
        let amount = v.get(key)?.as_i64()?;
        let currency = v.get("currency")?.as_str()?;
        Money::new(amount, currency).ok()
    };

    let kind = match event.event_type.as_str() {
        "payment_intent.succeeded" => WebhookEventKind::TransactionSucceeded,
        "payment_intent.payment_failed" => WebhookEventKind::TransactionFailed,
        "charge.refunded" => WebhookEventKind::TransactionRefunded,
        _ => WebhookEventKind::Unhandled,
    };

    let mut normalized = NormalizedEvent::new(event.id.clone(), kind, event.event_type.clone());

    match kind {
        WebhookEventKind::TransactionSucceeded => {
            normalized.provider_transaction_id = str_field(object, "id");
            normalized.amount = money_field(object, "amount");
            normalized.charge_ref = object
                .get("charges")
                .and_then(Value::as_array)
                .and_then(|charges| charges.first())
                .and_then(|c| str_field(c, "id"));
        }
        WebhookEventKind::TransactionFailed => {
            normalized.provider_transaction_id = str_field(object, "id");
            normalized.failure_reason = object
                .get("last_payment_error")
                .and_then(|e| str_field(e, "message"))
                .or_else(|| Some("payment failed".to_string()));
        }
        WebhookEventKind::TransactionRefunded => {
            normalized.provider_transaction_id = str_field(object, "payment_intent_id");
            normalized.charge_ref = str_field(object, "id");

            // Latest refund on the charge, `refunds` may be a list or `{ data: [...] }`
            let refunds = object
                .get("refunds")
                .and_then(|r| r.as_array().or_else(|| r.get("data").and_then(Value::as_array)));
            match refunds.and_then(|list| list.last()) {
                Some(refund) => {
                    normalized.provider_refund_id = str_field(refund, "id");
                    let currency = refund
                        .get("currency")
                        .or_else(|| object.get("currency"))
                        .and_then(Value::as_str);
                    normalized.amount = match (refund.get("amount").and_then(Value::as_i64), currency) {
                        (Some(amount), Some(currency)) => Money::new(amount, currency).ok(),
                        _ => None,
                    };
                }
                None => {
                    normalized.amount = money_field(object, "amount_refunded");
                }
            }
        }
        WebhookEventKind::Unhandled => {}
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::signature::sign_timestamped;

    fn gateway() -> TilledGateway {
        TilledGateway::new(TilledConfig::new(
            "sk_test".to_string(),
            "acct_test".to_string(),
            "whsec_test_secret".to_string(),
            true,
        ))
        .unwrap()
    }

    #[test]
    fn test_sandbox_base_path() {
        let gw = gateway();
        assert_eq!(gw.config.base_path, "https://sandbox-api.tilled.com");
    }

    #[test]
    fn test_signature_verification() {
        let gw = gateway();
        let body = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"id":"pi_1"}}"#;
        let header = sign_timestamped(body, "whsec_test_secret", chrono::Utc::now().timestamp());
        assert!(gw.verify_webhook_signature(body, &header, gw.webhook_secret()));
        assert!(!gw.verify_webhook_signature(body, "t=1,v1=00", gw.webhook_secret()));
    }

    #[test]
    fn test_parse_succeeded_with_object_wrapper() {
        let body = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi_123","amount":5000,"currency":"usd"}}}"#;
        let event = parse_tilled_event(body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::TransactionSucceeded);
        assert_eq!(event.provider_transaction_id.as_deref(), Some("pi_123"));
        assert_eq!(event.amount, Some(Money::new(5000, "USD").unwrap()));
    }

    #[test]
    fn test_parse_failed_reason() {
        let body = br#"{"id":"evt_2","type":"payment_intent.payment_failed","data":{"id":"pi_9","last_payment_error":{"message":"Your card was declined"}}}"#;
        let event = parse_tilled_event(body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::TransactionFailed);
        assert_eq!(event.failure_reason.as_deref(), Some("Your card was declined"));
    }

    #[test]
    fn test_parse_refund_takes_latest_refund() {
        let body = br#"{"id":"evt_3","type":"charge.refunded","data":{"id":"ch_1","payment_intent_id":"pi_9","currency":"usd","amount_refunded":1500,"refunds":[{"id":"rf_1","amount":500},{"id":"rf_2","amount":1000}]}}"#;
        let event = parse_tilled_event(body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::TransactionRefunded);
        assert_eq!(event.provider_transaction_id.as_deref(), Some("pi_9"));
        assert_eq!(event.provider_refund_id.as_deref(), Some("rf_2"));
        assert_eq!(event.amount, Some(Money::new(1000, "USD").unwrap()));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            authorization_status("requires_payment_method").unwrap(),
            AuthorizationStatus::RequiresMethod
        );
        assert_eq!(
            authorization_status("requires_capture").unwrap(),
            AuthorizationStatus::RequiresConfirmation
        );
        assert!(authorization_status("canceled").is_err());
    }
}
