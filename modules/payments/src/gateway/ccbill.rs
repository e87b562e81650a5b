//! Adult-billing processor driver (CCBill)
//!
//! Sales happen on a hosted form, so `authorize` only builds the redirect URL
//! and the sale result arrives by webhook. Refunds and voids go through the
//! DataLink subscription management endpoint.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;

use super::signature::verify_body_hmac;
use super::{
    Authorization, AuthorizationStatus, AuthorizeRequest, CaptureResult, GatewayDriver,
    GatewayError, MethodDescriptor, NormalizedEvent, RefundResult, WebhookEventKind,
};
use crate::money::{Currency, Money};

pub const CCBILL_DRIVER: &str = "ccbill";
pub const CCBILL_SIGNATURE_HEADER: &str = "x-ccbill-signature";

const FORM_URL: &str = "https://bill.ccbill.com/jpost/signup.cgi";
const DATALINK_URL: &str = "https://datalink.ccbill.com/utils/subscriptionManagement.cgi";

#[derive(Debug, Clone)]
pub struct CcbillConfig {
    pub account: String,
    pub subaccount: String,
    pub webhook_secret: String,
    pub datalink_user: Option<String>,
    pub datalink_password: Option<String>,
    pub form_name: String,
}

pub struct CcbillGateway {
    config: CcbillConfig,
    http_client: Client,
}

/// ISO-4217 numeric codes CCBill uses for billed currencies
fn numeric_currency_code(currency: Currency) -> Option<&'static str> {
    match currency.as_str() {
        "USD" => Some("840"),
        "EUR" => Some("978"),
        "GBP" => Some("826"),
        "CAD" => Some("124"),
        "AUD" => Some("036"),
        "JPY" => Some("392"),
        _ => None,
    }
}

fn currency_from_numeric(code: &str) -> Option<Currency> {
    let alpha = match code.trim_start_matches('0') {
        "840" => "USD",
        "978" => "EUR",
        "826" => "GBP",
        "124" => "CAD",
        "36" => "AUD",
        "392" => "JPY",
        _ => return None,
    };
    Currency::new(alpha).ok()
}

/// Format minor units as the decimal string CCBill expects ("25.00" for USD,
/// "2500" for JPY)
fn format_decimal(amount: Money) -> String {
    let exponent = amount.currency.minor_unit_exponent();
    if exponent == 0 {
        return amount.amount_minor.to_string();
    }
    let scale = 10_i64.pow(exponent);
    format!(
        "{}.{:0width$}",
        amount.amount_minor / scale,
        amount.amount_minor % scale,
        width = exponent as usize
    )
}

/// Parse a decimal amount ("25", "25.5", "25.00") into minor units of
/// `currency`
fn parse_decimal(raw: &str, currency: Currency) -> Option<i64> {
    let exponent = currency.minor_unit_exponent() as usize;
    let raw = raw.trim();
    let (whole, frac) = match raw.split_once('.') {
        Some((whole, frac)) => (whole, frac.trim_end_matches('0')),
        None => (raw, ""),
    };
    if whole.is_empty() || frac.len() > exponent {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let scale = 10_i64.pow(exponent as u32);
    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        frac.parse::<i64>().ok()? * 10_i64.pow((exponent - frac.len()) as u32)
    };
    whole.checked_mul(scale)?.checked_add(frac)
}

impl CcbillGateway {
    pub fn new(config: CcbillConfig) -> Result<Self, GatewayError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn form_url(&self, provider_ref: &str, amount: Money) -> Result<String, GatewayError> {
        let currency_code = numeric_currency_code(amount.currency).ok_or_else(|| {
            GatewayError::Unsupported {
                driver: CCBILL_DRIVER.to_string(),
                operation: "authorize in this currency",
            }
        })?;
        let price = format_decimal(amount);

        let url = Url::parse_with_params(
            FORM_URL,
            &[
                ("clientAccnum", self.config.account.as_str()),
                ("clientSubacc", self.config.subaccount.as_str()),
                ("formName", self.config.form_name.as_str()),
                ("initialPrice", price.as_str()),
                ("initialPeriod", "30"),
                ("currencyCode", currency_code),
                ("X-reference", provider_ref),
            ],
        )
        .map_err(|e| GatewayError::Config(e.to_string()))?;

        Ok(url.to_string())
    }

    /// Call a DataLink action. DataLink answers `1` on success and `0` or a
    /// negative code on failure, as the last line of a plain-text body.
    async fn datalink(&self, action: &str, params: &[(&str, String)]) -> Result<(), GatewayError> {
        let (Some(user), Some(password)) = (
            self.config.datalink_user.as_deref(),
            self.config.datalink_password.as_deref(),
        ) else {
            return Err(GatewayError::Config(
                "DataLink credentials are not configured".to_string(),
            ));
        };

        let mut query: Vec<(&str, String)> = vec![
            ("action", action.to_string()),
            ("clientAccnum", self.config.account.clone()),
            ("clientSubacc", self.config.subaccount.clone()),
            ("username", user.to_string()),
            ("password", password.to_string()),
        ];
        query.extend(params.iter().cloned());

        let response = self
            .http_client
            .get(DATALINK_URL)
            .query(&query)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Unavailable(format!(
                "DataLink status {}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let result = body.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim();

        if result == "1" {
            Ok(())
        } else {
            Err(GatewayError::Declined(format!(
                "DataLink {} returned {:?}",
                action, result
            )))
        }
    }
}

#[async_trait]
impl GatewayDriver for CcbillGateway {
    fn name(&self) -> &str {
        CCBILL_DRIVER
    }

    fn signature_header(&self) -> &'static str {
        CCBILL_SIGNATURE_HEADER
    }

    fn webhook_secret(&self) -> &str {
        &self.config.webhook_secret
    }

    async fn authorize(&self, request: &AuthorizeRequest) -> Result<Authorization, GatewayError> {
        let provider_ref = format!("ccbill_{}", request.intent_uuid.simple());
        let redirect_url = self.form_url(&provider_ref, request.amount)?;

        Ok(Authorization {
            provider_ref,
            status: AuthorizationStatus::Pending,
            redirect_url: Some(redirect_url),
        })
    }

    async fn capture(
        &self,
        provider_ref: &str,
        amount: Money,
        _idempotency_key: &str,
    ) -> Result<CaptureResult, GatewayError> {
        // Hosted-form sales settle at the processor; capture only acknowledges.
        Ok(CaptureResult {
            provider_ref: provider_ref.to_string(),
            amount,
            charge_ref: None,
        })
    }

    async fn refund(
        &self,
        provider_ref: &str,
        amount: Money,
        _reason: &str,
        _idempotency_key: &str,
    ) -> Result<RefundResult, GatewayError> {
        self.datalink(
            "refundTransaction",
            &[
                ("subscriptionId", provider_ref.to_string()),
                ("amount", format_decimal(amount)),
            ],
        )
        .await?;

        // DataLink returns no refund id; the Refund postback carries it.
        Ok(RefundResult {
            provider_refund_id: None,
            amount,
        })
    }

    async fn void(&self, provider_ref: &str) -> Result<(), GatewayError> {
        if provider_ref.starts_with("ccbill_") {
            // Hosted form never completed; nothing exists at the processor.
            return Ok(());
        }
        self.datalink(
            "voidTransaction",
            &[("subscriptionId", provider_ref.to_string())],
        )
        .await
    }

    async fn vault_token(&self, _raw_token: &str) -> Result<MethodDescriptor, GatewayError> {
        Err(GatewayError::Unsupported {
            driver: CCBILL_DRIVER.to_string(),
            operation: "vault_token",
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_body_hmac(payload, signature, secret)
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<NormalizedEvent, GatewayError> {
        parse_ccbill_event(payload)
    }
}

fn parse_ccbill_event(payload: &[u8]) -> Result<NormalizedEvent, GatewayError> {
    let body: Value = serde_json::from_slice(payload)
        .map_err(|e| GatewayError::InvalidResponse(format!("ccbill webhook: {}", e)))?;

    // CCBill sends most scalars as strings, but numbers show up in test tooling
    let field = |key: &str| -> Option<String> {
        match body.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };

    let event_type = field("eventType")
        .ok_or_else(|| GatewayError::InvalidResponse("ccbill webhook: missing eventType".to_string()))?;
    let transaction_id = field("transactionId");
    let subscription_id = field("subscriptionId");

    let kind = match event_type.as_str() {
        "NewSaleSuccess" | "RenewalSuccess" => WebhookEventKind::TransactionSucceeded,
        "NewSaleFailure" | "RenewalFailure" => WebhookEventKind::TransactionFailed,
        "Refund" | "Chargeback" | "Void" => WebhookEventKind::TransactionRefunded,
        _ => WebhookEventKind::Unhandled,
    };

    // No delivery id in the payload; event type plus transaction identifies it.
    let event_id = format!(
        "{}:{}",
        event_type,
        transaction_id
            .as_deref()
            .or(subscription_id.as_deref())
            .unwrap_or("unknown")
    );

    let currency = field("billedCurrencyCode")
        .or_else(|| field("currencyCode"))
        .and_then(|code| currency_from_numeric(&code));
    let amount = currency.and_then(|currency| {
        field("amount")
            .or_else(|| field("billedAmount"))
            .or_else(|| field("accountingAmount"))
            .and_then(|raw| parse_decimal(&raw, currency))
            .map(|minor| Money::from_minor(minor, currency))
    });

    let mut event = NormalizedEvent::new(event_id, kind, event_type);
    event.provider_transaction_id = field("X-reference").or_else(|| subscription_id.clone());
    event.charge_ref = subscription_id;
    event.amount = amount;

    match kind {
        WebhookEventKind::TransactionFailed => {
            event.failure_reason = field("failureReason").or_else(|| field("failureCode"));
        }
        WebhookEventKind::TransactionRefunded => {
            event.provider_refund_id = transaction_id;
        }
        _ => {}
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::signature::hmac_sha256_hex;
    use crate::models::Metadata;
    use uuid::Uuid;

    fn gateway() -> CcbillGateway {
        CcbillGateway::new(CcbillConfig {
            account: "900000".to_string(),
            subaccount: "0000".to_string(),
            webhook_secret: "ccbill_secret".to_string(),
            datalink_user: None,
            datalink_password: None,
            form_name: "cc".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_decimal_parsing() {
        let usd = Currency::USD;
        assert_eq!(parse_decimal("25.00", usd), Some(2500));
        assert_eq!(parse_decimal("25.5", usd), Some(2550));
        assert_eq!(parse_decimal("7", usd), Some(700));
        assert_eq!(parse_decimal("1.234", usd), None);
        assert_eq!(parse_decimal("-1.00", usd), None);
        assert_eq!(format_decimal(Money::new(2505, "USD").unwrap()), "25.05");
    }

    #[test]
    fn test_decimals_follow_currency_exponent() {
        let jpy = Currency::new("JPY").unwrap();
        assert_eq!(format_decimal(Money::new(2500, "JPY").unwrap()), "2500");
        assert_eq!(parse_decimal("2500", jpy), Some(2500));
        assert_eq!(parse_decimal("2500.00", jpy), Some(2500));
        assert_eq!(parse_decimal("2500.5", jpy), None);
    }

    #[test]
    fn test_jpy_form_price_is_whole_yen() {
        let url = gateway()
            .form_url("ccbill_ref", Money::new(2500, "JPY").unwrap())
            .unwrap();
        assert!(url.contains("initialPrice=2500&"));
        assert!(url.contains("currencyCode=392"));
    }

    #[tokio::test]
    async fn test_authorize_builds_hosted_form() {
        let gw = gateway();
        let request = AuthorizeRequest {
            intent_uuid: Uuid::new_v4(),
            amount: Money::new(2500, "USD").unwrap(),
            payer_id: 1,
            payee_id: Some(2),
            method: "ccbill".to_string(),
            metadata: Metadata::new(),
            idempotency_key: "k".to_string(),
        };
        let auth = gw.authorize(&request).await.unwrap();

        assert_eq!(auth.status, AuthorizationStatus::Pending);
        let url = auth.redirect_url.unwrap();
        assert!(url.contains("initialPrice=25.00"));
        assert!(url.contains("currencyCode=840"));
        assert!(url.contains(&auth.provider_ref));
    }

    #[tokio::test]
    async fn test_refund_without_datalink_credentials_is_config_error() {
        let gw = gateway();
        let err = gw
            .refund("1234", Money::new(100, "USD").unwrap(), "r", "k")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_signature_is_body_hmac() {
        let gw = gateway();
        let body = br#"{"eventType":"NewSaleSuccess"}"#;
        let sig = hmac_sha256_hex("ccbill_secret", body);
        assert!(gw.verify_webhook_signature(body, &sig, gw.webhook_secret()));
        assert!(!gw.verify_webhook_signature(body, "deadbeef", gw.webhook_secret()));
    }

    #[test]
    fn test_parse_new_sale_success() {
        let body = br#"{"eventType":"NewSaleSuccess","transactionId":"0912","subscriptionId":"1000001","X-reference":"ccbill_abc","billedAmount":"25.00","billedCurrencyCode":"840"}"#;
        let event = parse_ccbill_event(body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::TransactionSucceeded);
        assert_eq!(event.event_id, "NewSaleSuccess:0912");
        assert_eq!(event.provider_transaction_id.as_deref(), Some("ccbill_abc"));
        assert_eq!(event.charge_ref.as_deref(), Some("1000001"));
        assert_eq!(event.amount, Some(Money::new(2500, "USD").unwrap()));
    }

    #[test]
    fn test_parse_refund_and_failure() {
        let refund = br#"{"eventType":"Refund","transactionId":"77","subscriptionId":"1000001","amount":"10.00","currencyCode":"978"}"#;
        let event = parse_ccbill_event(refund).unwrap();
        assert_eq!(event.kind, WebhookEventKind::TransactionRefunded);
        assert_eq!(event.provider_refund_id.as_deref(), Some("77"));
        assert_eq!(event.amount, Some(Money::new(1000, "EUR").unwrap()));

        let yen = br#"{"eventType":"Refund","transactionId":"79","subscriptionId":"1000002","amount":"2500","currencyCode":"392"}"#;
        let event = parse_ccbill_event(yen).unwrap();
        assert_eq!(event.amount, Some(Money::new(2500, "JPY").unwrap()));

        let failure = br#"{"eventType":"NewSaleFailure","transactionId":"78","X-reference":"ccbill_x","failureReason":"Card declined"}"#;
        let event = parse_ccbill_event(failure).unwrap();
        assert_eq!(event.kind, WebhookEventKind::TransactionFailed);
        assert_eq!(event.failure_reason.as_deref(), Some("Card declined"));
    }

    #[test]
    fn test_missing_event_type_rejected() {
        assert!(parse_ccbill_event(br#"{"transactionId":"1"}"#).is_err());
    }
}
