//! Webhook ingestion over HTTP, processing and the queue worker

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use event_bus::consumer_retry::RetryConfig;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use common::*;
use payments_core_rs::events::{
    SUBJECT_INTENT_SUCCEEDED, SUBJECT_PAYMENT_CAPTURED, SUBJECT_PAYMENT_FAILED,
    SUBJECT_PAYMENT_REFUNDED,
};
use payments_core_rs::gateway::fake::{FAKE_DRIVER, FAKE_SIGNATURE_HEADER};
use payments_core_rs::models::{
    IntentStatus, PaymentStatus, PaymentWebhook, RefundStatus, WebhookStatus,
};
use payments_core_rs::services::{
    ProcessOutcome, RefundData, WebhookIngestor, UNKNOWN_EVENT_TYPE,
};
use payments_core_rs::store::PaymentStore;
use payments_core_rs::worker::webhook_worker::requeue_pending;
use payments_core_rs::worker::{webhook_queue, WebhookWorker};

fn post_webhook(provider: &str, signature: Option<&str>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/payments/{}", provider))
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(FAKE_SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn webhook(h: &TestHarness, id: Uuid) -> PaymentWebhook {
    h.store.get_webhook(id).await.unwrap().expect("webhook row")
}

// ============================================================================
// HTTP boundary
// ============================================================================

#[tokio::test]
async fn test_signed_webhook_is_accepted_and_stored() {
    let h = harness();
    let body = webhook_body("evt_http_1", "transaction.succeeded", "fake_pi_999999", None);
    let signature = sign(WEBHOOK_SECRET, &body);

    let response = h
        .ctx
        .router()
        .oneshot(post_webhook(FAKE_DRIVER, Some(&signature), body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(h.store.count_webhooks(FAKE_DRIVER).await.unwrap(), 1);
}

#[tokio::test]
async fn test_bad_signature_is_rejected_without_row() {
    let h = harness();
    let body = webhook_body("evt_bad", "transaction.succeeded", "fake_pi_000001", None);
    let forged = sign("not-the-secret", &body);

    let response = h
        .ctx
        .router()
        .oneshot(post_webhook(FAKE_DRIVER, Some(&forged), body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = h
        .ctx
        .router()
        .oneshot(post_webhook(FAKE_DRIVER, None, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    assert_eq!(h.store.count_webhooks(FAKE_DRIVER).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_provider_is_not_found() {
    let h = harness();
    let body = webhook_body("evt_x", "transaction.succeeded", "ref", None);
    let signature = sign(WEBHOOK_SECRET, &body);

    let response = h
        .ctx
        .router()
        .oneshot(post_webhook("paypal", Some(&signature), body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = harness();

    for path in ["/health/live", "/health/ready"] {
        let response = h
            .ctx
            .router()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{}", path);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["status"].is_string(), "{}", path);
    }
}

// ============================================================================
// Processing
// ============================================================================

#[tokio::test]
async fn test_succeeded_webhook_captures_hosted_payment() {
    let h = harness();
    let intent = h.hosted_intent(2500).await;
    assert_eq!(intent.status, IntentStatus::Pending);
    let provider_ref = intent.provider_intent_id.clone().unwrap();

    let id = h
        .deliver(&webhook_body("evt_1", "transaction.succeeded", &provider_ref, Some(2500)))
        .await;
    assert_eq!(webhook(&h, id).await.status, WebhookStatus::Pending);

    let outcome = h.ctx.processor.process(id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Processed);

    let payment = h.payment(intent.payment_id.unwrap()).await;
    assert_eq!(payment.status, PaymentStatus::Captured);
    assert!(payment.captured_at.is_some());
    let intent = h.ctx.payments.get_intent(intent.id).await.unwrap();
    assert_eq!(intent.status, IntentStatus::Succeeded);

    assert_eq!(h.ledger(payment.id).await.len(), 2);
    assert_eq!(h.events.count(SUBJECT_PAYMENT_CAPTURED), 1);
    assert_eq!(h.events.count(SUBJECT_INTENT_SUCCEEDED), 1);
    assert_eq!(h.fake.capture_calls(), 0);

    let row = webhook(&h, id).await;
    assert_eq!(row.status, WebhookStatus::Processed);
    assert_eq!(row.attempts, 1);
    assert!(row.processed_at.is_some());
    assert_eq!(row.metadata.get("payment_id"), Some(&json!(payment.id)));
}

#[tokio::test]
async fn test_duplicate_delivery_has_no_side_effects() {
    let h = harness();
    let intent = h.hosted_intent(1000).await;
    let provider_ref = intent.provider_intent_id.clone().unwrap();
    let body = webhook_body("evt_dup", "transaction.succeeded", &provider_ref, Some(1000));

    let first = h.deliver(&body).await;
    let second = h.deliver(&body).await;
    assert_ne!(first, second);

    assert_eq!(h.ctx.processor.process(first).await.unwrap(), ProcessOutcome::Processed);
    assert_eq!(
        h.ctx.processor.process(second).await.unwrap(),
        ProcessOutcome::Duplicate { original: first }
    );

    let payment_id = intent.payment_id.unwrap();
    assert_eq!(h.ledger(payment_id).await.len(), 2);
    assert_eq!(h.events.count(SUBJECT_PAYMENT_CAPTURED), 1);

    let row = webhook(&h, second).await;
    assert_eq!(row.status, WebhookStatus::Processed);
    assert_eq!(row.metadata.get("duplicate_of"), Some(&json!(first)));

    // Re-running a processed row is a no-op
    assert_eq!(
        h.ctx.processor.process(first).await.unwrap(),
        ProcessOutcome::AlreadyProcessed
    );
}

#[tokio::test]
async fn test_repeat_notice_under_new_event_id_is_harmless() {
    let h = harness();
    let intent = h.hosted_intent(1000).await;
    let provider_ref = intent.provider_intent_id.clone().unwrap();

    let first = h
        .deliver(&webhook_body("evt_a", "transaction.succeeded", &provider_ref, None))
        .await;
    let second = h
        .deliver(&webhook_body("evt_b", "transaction.succeeded", &provider_ref, None))
        .await;

    assert_eq!(h.ctx.processor.process(first).await.unwrap(), ProcessOutcome::Processed);
    assert_eq!(h.ctx.processor.process(second).await.unwrap(), ProcessOutcome::Processed);

    assert_eq!(h.ledger(intent.payment_id.unwrap()).await.len(), 2);
    assert_eq!(h.events.count(SUBJECT_PAYMENT_CAPTURED), 1);
}

#[tokio::test]
async fn test_webhook_after_api_capture_does_not_double_post() {
    let h = harness();
    let (intent, payment) = h.captured_payment(1500).await;
    let provider_ref = intent.provider_intent_id.clone().unwrap();

    let id = h
        .deliver(&webhook_body("evt_late", "transaction.succeeded", &provider_ref, Some(1500)))
        .await;
    assert_eq!(h.ctx.processor.process(id).await.unwrap(), ProcessOutcome::Processed);

    assert_eq!(h.ledger(payment.id).await.len(), 2);
    assert_eq!(h.events.count(SUBJECT_PAYMENT_CAPTURED), 1);
}

#[tokio::test]
async fn test_capture_amount_mismatch_fails_webhook() {
    let h = harness();
    let intent = h.hosted_intent(2500).await;
    let provider_ref = intent.provider_intent_id.clone().unwrap();

    let id = h
        .deliver(&webhook_body("evt_short", "transaction.succeeded", &provider_ref, Some(2000)))
        .await;
    let outcome = h.ctx.processor.process(id).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Failed(_)));

    let row = webhook(&h, id).await;
    assert_eq!(row.status, WebhookStatus::Failed);
    assert_eq!(row.metadata.get("error_code"), Some(&json!("invalid_amount")));

    let payment = h.payment(intent.payment_id.unwrap()).await;
    assert!(!payment.status.is_captured());
    assert!(h.ledger(payment.id).await.is_empty());
    assert_eq!(h.events.count(SUBJECT_PAYMENT_CAPTURED), 0);
}

#[tokio::test]
async fn test_unknown_transaction_is_recorded_as_failed() {
    let h = harness();

    let id = h
        .deliver(&webhook_body("evt_orphan", "transaction.succeeded", "fake_pi_424242", None))
        .await;
    let outcome = h.ctx.processor.process(id).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Failed(_)));

    let row = webhook(&h, id).await;
    assert_eq!(row.status, WebhookStatus::Failed);
    assert!(row.metadata.contains_key("error"));
    assert_eq!(
        row.metadata.get("provider_payment_id"),
        Some(&json!("fake_pi_424242"))
    );
    assert!(h.events.subjects().is_empty());
}

#[tokio::test]
async fn test_failed_webhook_fails_payment_and_intent() {
    let h = harness();
    let intent = h.hosted_intent(800).await;
    let provider_ref = intent.provider_intent_id.clone().unwrap();

    let body = serde_json::to_vec(&json!({
        "id": "evt_fail",
        "type": "transaction.failed",
        "transaction_id": provider_ref,
        "failure_reason": "card_expired",
    }))
    .unwrap();
    let id = h.deliver(&body).await;
    assert_eq!(h.ctx.processor.process(id).await.unwrap(), ProcessOutcome::Processed);

    let payment = h.payment(intent.payment_id.unwrap()).await;
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(
        payment.metadata.get("failure_reason"),
        Some(&json!("card_expired"))
    );
    let intent = h.ctx.payments.get_intent(intent.id).await.unwrap();
    assert_eq!(intent.status, IntentStatus::Failed);
    assert_eq!(h.events.count(SUBJECT_PAYMENT_FAILED), 1);
    assert!(h.ledger(payment.id).await.is_empty());
}

#[tokio::test]
async fn test_late_failure_never_undoes_capture() {
    let h = harness();
    let (intent, payment) = h.captured_payment(800).await;
    let provider_ref = intent.provider_intent_id.clone().unwrap();

    let id = h
        .deliver(&webhook_body("evt_late_fail", "transaction.failed", &provider_ref, None))
        .await;
    assert_eq!(h.ctx.processor.process(id).await.unwrap(), ProcessOutcome::Processed);

    assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Captured);
    assert_eq!(h.events.count(SUBJECT_PAYMENT_FAILED), 0);
}

#[tokio::test]
async fn test_refunded_webhook_records_provider_refund() {
    let h = harness();
    let (intent, payment) = h.captured_payment(1000).await;
    let provider_ref = intent.provider_intent_id.clone().unwrap();

    let refund_body = |event_id: &str| {
        serde_json::to_vec(&json!({
            "id": event_id,
            "type": "transaction.refunded",
            "transaction_id": provider_ref,
            "amount": 400,
            "currency": "USD",
            "refund_id": "re_42",
        }))
        .unwrap()
    };

    let first = h.deliver(&refund_body("evt_r1")).await;
    assert_eq!(h.ctx.processor.process(first).await.unwrap(), ProcessOutcome::Processed);

    // Same provider refund reported again under a new event id
    let second = h.deliver(&refund_body("evt_r2")).await;
    assert_eq!(h.ctx.processor.process(second).await.unwrap(), ProcessOutcome::Processed);

    let refunds = h.store.list_refunds(payment.id).await.unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, usd(400));
    assert_eq!(refunds[0].provider_refund_id.as_deref(), Some("re_42"));
    assert_eq!(h.fake.refund_calls(), 0);
    assert_eq!(h.ledger(payment.id).await.len(), 4);
    assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Captured);
}

#[tokio::test]
async fn test_refund_webhook_after_api_refund_without_provider_id() {
    let h = harness();
    // Processors like CCBill only report the refund id on their postback
    h.fake.set_deferred_refund_ids(true);
    let (intent, payment) = h.captured_payment(1000).await;
    let provider_ref = intent.provider_intent_id.clone().unwrap();

    let api_refund = h
        .ctx
        .payments
        .refund(payment.id, RefundData::new(Some(usd(400)), "customer request"))
        .await
        .unwrap();
    assert_eq!(api_refund.status, RefundStatus::Succeeded);
    assert!(api_refund.provider_refund_id.is_none());
    assert_eq!(h.ledger(payment.id).await.len(), 4);

    let refund_body = |event_id: &str| {
        serde_json::to_vec(&json!({
            "id": event_id,
            "type": "transaction.refunded",
            "transaction_id": provider_ref,
            "amount": 400,
            "currency": "USD",
            "refund_id": "re_77",
        }))
        .unwrap()
    };

    let first = h.deliver(&refund_body("evt_rf1")).await;
    assert_eq!(h.ctx.processor.process(first).await.unwrap(), ProcessOutcome::Processed);
    let second = h.deliver(&refund_body("evt_rf2")).await;
    assert_eq!(h.ctx.processor.process(second).await.unwrap(), ProcessOutcome::Processed);

    let refunds = h.store.list_refunds(payment.id).await.unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].id, api_refund.id);
    assert_eq!(refunds[0].provider_refund_id.as_deref(), Some("re_77"));
    assert_eq!(h.ledger(payment.id).await.len(), 4);
    assert_eq!(h.events.count(SUBJECT_PAYMENT_REFUNDED), 1);
    assert_eq!(h.fake.refund_calls(), 1);
    assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Captured);
}

#[tokio::test]
async fn test_refund_webhook_for_pending_payment_fails_row() {
    let h = harness();
    let intent = h.hosted_intent(1000).await;
    let provider_ref = intent.provider_intent_id.clone().unwrap();

    let id = h
        .deliver(&webhook_body("evt_early_refund", "transaction.refunded", &provider_ref, Some(1000)))
        .await;
    let outcome = h.ctx.processor.process(id).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Failed(_)));

    let row = webhook(&h, id).await;
    assert_eq!(row.status, WebhookStatus::Failed);
    assert_eq!(row.metadata.get("error_code"), Some(&json!("invalid_state")));
}

#[tokio::test]
async fn test_unhandled_event_type_is_ignored() {
    let h = harness();

    let id = h
        .deliver(&webhook_body("evt_misc", "customer.updated", "fake_pi_000001", None))
        .await;
    assert_eq!(h.ctx.processor.process(id).await.unwrap(), ProcessOutcome::Ignored);

    let row = webhook(&h, id).await;
    assert_eq!(row.status, WebhookStatus::Processed);
    assert_eq!(row.metadata.get("ignored"), Some(&json!(true)));
}

#[tokio::test]
async fn test_unparseable_payload_is_kept_and_failed() {
    let h = harness();

    let id = h.deliver(b"this is not json").await;
    let row = webhook(&h, id).await;
    assert_eq!(row.event_type, UNKNOWN_EVENT_TYPE);
    assert!(row.event_id.is_none());

    let outcome = h.ctx.processor.process(id).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Failed(_)));
    assert_eq!(webhook(&h, id).await.status, WebhookStatus::Failed);
}

// ============================================================================
// Queue worker
// ============================================================================

#[tokio::test]
async fn test_worker_processes_queued_webhooks() {
    let h = harness();
    let intent = h.hosted_intent(1200).await;
    let provider_ref = intent.provider_intent_id.clone().unwrap();

    let (tx, rx) = webhook_queue(16);
    let ingestor = WebhookIngestor::new(h.ctx.store.clone(), h.ctx.gateways.clone(), Some(tx));
    let worker = WebhookWorker::new(h.ctx.processor.clone(), RetryConfig::no_retry()).spawn(rx);

    let body = webhook_body("evt_q", "transaction.succeeded", &provider_ref, Some(1200));
    let id = ingestor
        .ingest(FAKE_DRIVER, &signed_headers(&body), &body)
        .await
        .unwrap();

    let mut status = WebhookStatus::Pending;
    for _ in 0..100 {
        status = webhook(&h, id).await.status;
        if status != WebhookStatus::Pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, WebhookStatus::Processed);
    assert_eq!(
        h.payment(intent.payment_id.unwrap()).await.status,
        PaymentStatus::Captured
    );

    // Dropping the last sender stops the worker
    drop(ingestor);
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker stops")
        .unwrap();
}

#[tokio::test]
async fn test_requeue_pending_webhooks() {
    let h = harness();

    // The harness ingestor has no queue, so these stay Pending
    let body = webhook_body("evt_p1", "customer.updated", "x", None);
    let first = h.deliver(&body).await;
    let body = webhook_body("evt_p2", "customer.updated", "y", None);
    let second = h.deliver(&body).await;
    h.ctx.processor.process(second).await.unwrap();

    let (tx, mut rx) = webhook_queue(4);
    let requeued = requeue_pending(
        h.store.as_ref(),
        &tx,
        Utc::now() + chrono::Duration::seconds(1),
        10,
    )
    .await
    .unwrap();

    assert_eq!(requeued, 1);
    assert_eq!(rx.recv().await, Some(first));
}
