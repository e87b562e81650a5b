//! Vaulted payment methods and the one-default-per-user rule

mod common;

use chrono::Utc;
use uuid::Uuid;

use common::*;
use payments_core_rs::error::PaymentError;
use payments_core_rs::gateway::fake::FAKE_DRIVER;

#[tokio::test]
async fn test_first_method_becomes_default() {
    let h = harness();
    let methods = &h.ctx.payment_methods;

    let first = methods.vault(PAYER, None, "tok_visa_4242").await.unwrap();
    let second = methods
        .vault(PAYER, Some(FAKE_DRIVER), "tok_amex_0005")
        .await
        .unwrap();

    assert!(first.is_default);
    assert!(!second.is_default);
    assert_eq!(first.provider, FAKE_DRIVER);
    assert_eq!(first.provider_method_id, "fake_pm_tok_visa_4242");
    assert_eq!(first.last_four.as_deref(), Some("4242"));
    assert_eq!(second.last_four.as_deref(), Some("0005"));

    // Defaults are per user
    let other = methods.vault(PAYEE, None, "tok_other_1111").await.unwrap();
    assert!(other.is_default);
}

#[tokio::test]
async fn test_vaulting_same_token_is_idempotent() {
    let h = harness();
    let methods = &h.ctx.payment_methods;

    let first = methods.vault(PAYER, None, "tok_same").await.unwrap();
    let again = methods.vault(PAYER, None, "tok_same").await.unwrap();

    assert_eq!(first.id, again.id);
    assert_eq!(methods.list_for_user(PAYER).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rejected_token_and_unknown_gateway() {
    let h = harness();
    let methods = &h.ctx.payment_methods;

    let err = methods.vault(PAYER, None, "tok_fail_expired").await.unwrap_err();
    assert!(matches!(err, PaymentError::GatewayDeclined(_)));

    let err = methods
        .vault(PAYER, Some("nowhere"), "tok_visa")
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::GatewayResolution(_)));

    assert!(methods.list_for_user(PAYER).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_set_default_moves_the_flag() {
    let h = harness();
    let methods = &h.ctx.payment_methods;
    let first = methods.vault(PAYER, None, "tok_a").await.unwrap();
    let second = methods.vault(PAYER, None, "tok_b").await.unwrap();

    let updated = methods.set_default(PAYER, second.id).await.unwrap();
    assert!(updated.is_default);

    let listed = methods.list_for_user(PAYER).await.unwrap();
    let defaults: Vec<Uuid> = listed.iter().filter(|m| m.is_default).map(|m| m.id).collect();
    assert_eq!(defaults, vec![second.id]);
    assert!(listed.iter().any(|m| m.id == first.id && !m.is_default));

    // Already default
    let same = methods.set_default(PAYER, second.id).await.unwrap();
    assert!(same.is_default);
}

#[tokio::test]
async fn test_methods_are_scoped_to_their_owner() {
    let h = harness();
    let methods = &h.ctx.payment_methods;
    let mine = methods.vault(PAYER, None, "tok_mine").await.unwrap();

    let err = methods.set_default(PAYEE, mine.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::NotFound(_)));

    let err = methods.delete(PAYEE, mine.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::NotFound(_)));

    let err = methods.mark_used(PAYEE, mine.id, Utc::now()).await.unwrap_err();
    assert!(matches!(err, PaymentError::NotFound(_)));

    assert_eq!(methods.list_for_user(PAYER).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_deleting_default_does_not_promote_another() {
    let h = harness();
    let methods = &h.ctx.payment_methods;
    let first = methods.vault(PAYER, None, "tok_a").await.unwrap();
    methods.vault(PAYER, None, "tok_b").await.unwrap();

    methods.delete(PAYER, first.id).await.unwrap();

    let listed = methods.list_for_user(PAYER).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].is_default);
}

#[tokio::test]
async fn test_delete_clears_payment_reference() {
    let h = harness();
    let method = h
        .ctx
        .payment_methods
        .vault(PAYER, None, "tok_for_payment")
        .await
        .unwrap();

    let mut request = intent_request(usd(700));
    request.payment_method_id = Some(method.id);
    let intent = h.ctx.payments.create_intent(request).await.unwrap();
    let payment_id = intent.payment_id.unwrap();
    assert_eq!(h.payment(payment_id).await.payment_method_id, Some(method.id));

    h.ctx.payment_methods.delete(PAYER, method.id).await.unwrap();

    assert_eq!(h.payment(payment_id).await.payment_method_id, None);
}

#[tokio::test]
async fn test_mark_used_records_timestamp() {
    let h = harness();
    let method = h.ctx.payment_methods.vault(PAYER, None, "tok_used").await.unwrap();
    assert!(method.last_used_at.is_none());

    let used_at = Utc::now();
    let updated = h
        .ctx
        .payment_methods
        .mark_used(PAYER, method.id, used_at)
        .await
        .unwrap();

    assert_eq!(updated.last_used_at, Some(used_at));
    let listed = h.ctx.payment_methods.list_for_user(PAYER).await.unwrap();
    assert_eq!(listed[0].last_used_at, Some(used_at));
}
