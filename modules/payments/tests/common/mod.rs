//! Shared harness for the payments integration tests
//!
//! Wires the real services over `MemoryStore`, the fake gateway and an
//! in-process bus, and records every published subject.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::HeaderMap;
use event_bus::consumer_retry::RetryConfig;
use event_bus::{EventBus, EventEnvelope, EventHandler, HandlerError, InMemoryBus};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use payments_core_rs::config::{Config, StoreType};
use payments_core_rs::events::{PaymentBus, PaymentEvent, SOURCE_MODULE};
use payments_core_rs::gateway::fake::{FakeGateway, FAKE_DRIVER, FAKE_SIGNATURE_HEADER};
use payments_core_rs::gateway::PaymentGatewayManager;
use payments_core_rs::models::{Direction, LedgerEntry, Payable, Payment, PaymentIntent};
use payments_core_rs::money::Money;
use payments_core_rs::services::{CaptureData, CreateIntentRequest};
use payments_core_rs::store::{MemoryStore, PaymentStore};
use payments_core_rs::PaymentsContext;

pub const PAYER: i64 = 1;
pub const PAYEE: i64 = 2;
pub const WEBHOOK_SECRET: &str = "whsec_test";
/// 10% platform fee
pub const FEE_BPS: u32 = 1_000;

/// Records the subject of every event it sees
#[derive(Default)]
pub struct EventRecorder {
    subjects: Mutex<Vec<String>>,
}

impl EventRecorder {
    pub fn subjects(&self) -> Vec<String> {
        self.subjects.lock().unwrap().clone()
    }

    pub fn count(&self, subject: &str) -> usize {
        self.subjects().iter().filter(|s| s.as_str() == subject).count()
    }

    pub fn clear(&self) {
        self.subjects.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventHandler<PaymentEvent> for EventRecorder {
    fn name(&self) -> &'static str {
        "test_recorder"
    }

    async fn handle(&self, envelope: &EventEnvelope<PaymentEvent>) -> Result<(), HandlerError> {
        self.subjects.lock().unwrap().push(envelope.subject.clone());
        Ok(())
    }
}

pub struct TestHarness {
    pub ctx: PaymentsContext,
    pub store: Arc<MemoryStore>,
    pub fake: Arc<FakeGateway>,
    pub events: Arc<EventRecorder>,
    pub config: Config,
}

pub fn test_config() -> Config {
    Config {
        store_type: StoreType::Memory,
        fake_webhook_secret: WEBHOOK_SECRET.to_string(),
        platform_fee_bps: FEE_BPS,
        ..Config::default()
    }
}

pub fn harness() -> TestHarness {
    harness_with(|_| {})
}

pub fn harness_with(configure: impl FnOnce(&mut Config)) -> TestHarness {
    let mut config = test_config();
    configure(&mut config);

    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeGateway::new(config.fake_webhook_secret.clone()));
    let gateways = Arc::new(PaymentGatewayManager::new(FAKE_DRIVER).register(fake.clone()));
    let bus: PaymentBus = Arc::new(InMemoryBus::with_retry(SOURCE_MODULE, RetryConfig::no_retry()));

    let ctx = PaymentsContext::new(&config, store.clone(), gateways, bus.clone(), None)
        .expect("wire payments context");

    let events = Arc::new(EventRecorder::default());
    bus.subscribe("payments.>", events.clone())
        .expect("subscribe recorder");

    TestHarness {
        ctx,
        store,
        fake,
        events,
        config,
    }
}

pub fn usd(minor: i64) -> Money {
    Money::new(minor, "USD").unwrap()
}

pub fn intent_request(amount: Money) -> CreateIntentRequest {
    let mut request = CreateIntentRequest::new(PAYER, amount, Payable::PostPurchase(42));
    request.payee_id = Some(PAYEE);
    request
}

impl TestHarness {
    pub async fn create_intent(&self, amount_minor: i64) -> PaymentIntent {
        self.ctx
            .payments
            .create_intent(intent_request(usd(amount_minor)))
            .await
            .expect("create intent")
    }

    /// Create and capture an intent through the API path
    pub async fn captured_payment(&self, amount_minor: i64) -> (PaymentIntent, Payment) {
        let intent = self.create_intent(amount_minor).await;
        let data = CaptureData {
            provider_intent_id: intent.provider_intent_id.clone(),
            ..CaptureData::default()
        };
        let payment = self
            .ctx
            .payments
            .capture(intent.id, data)
            .await
            .expect("capture intent");
        let intent = self.ctx.payments.get_intent(intent.id).await.unwrap();
        (intent, payment)
    }

    /// Intent whose payment only completes through a provider webhook
    pub async fn hosted_intent(&self, amount_minor: i64) -> PaymentIntent {
        let mut request = intent_request(usd(amount_minor));
        request.method = "hosted".to_string();
        self.ctx
            .payments
            .create_intent(request)
            .await
            .expect("create hosted intent")
    }

    pub async fn payment(&self, id: Uuid) -> Payment {
        self.ctx.payments.get_payment(id).await.unwrap()
    }

    pub async fn ledger(&self, payment_id: Uuid) -> Vec<LedgerEntry> {
        self.store.list_ledger_entries(payment_id).await.unwrap()
    }

    /// Sum of entry amounts in one direction, optionally for one party
    pub async fn ledger_sum(&self, payment_id: Uuid, direction: Direction) -> i64 {
        self.ledger(payment_id)
            .await
            .iter()
            .filter(|e| e.direction == direction)
            .map(|e| e.amount.amount_minor)
            .sum()
    }

    /// Ingest a signed fake-provider webhook; processing is up to the caller
    pub async fn deliver(&self, body: &[u8]) -> Uuid {
        let headers = signed_headers(body);
        self.ctx
            .ingestor
            .ingest(FAKE_DRIVER, &headers, body)
            .await
            .expect("ingest webhook")
    }
}

pub fn webhook_body(
    event_id: &str,
    event_type: &str,
    transaction_id: &str,
    amount_minor: Option<i64>,
) -> Vec<u8> {
    let mut body = json!({
        "id": event_id,
        "type": event_type,
        "transaction_id": transaction_id,
    });
    if let Some(amount) = amount_minor {
        body["amount"] = json!(amount);
        body["currency"] = json!("USD");
    }
    serde_json::to_vec(&body).unwrap()
}

pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn signed_headers(body: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(FAKE_SIGNATURE_HEADER, sign(WEBHOOK_SECRET, body).parse().unwrap());
    headers
}
