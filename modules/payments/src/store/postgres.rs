//! Postgres store
//!
//! Single-row locks are `SELECT ... FOR UPDATE`; sweep batches use
//! `FOR UPDATE SKIP LOCKED` so overlapping sweeps split the work instead of
//! queueing behind each other. Unique violations surface as
//! [`StoreError::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{PaymentStore, StoreTx};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Direction, IntentStatus, LedgerEntry, Ledgerable, Metadata, Payable, Payment, PaymentIntent,
    PaymentMethod, PaymentStatus, PaymentSubscription, PaymentType, PaymentWebhook, Refund,
    RefundStatus, SubscriptionStatus, WebhookStatus,
};
use crate::money::{Currency, Money};

const INTENT_COLUMNS: &str = "id, uuid, provider, provider_intent_id, amount_minor, currency, \
    payer_id, payee_id, payment_type, method, status, metadata, payment_id, expires_at, \
    created_at, updated_at, succeeded_at, failed_at, cancelled_at";

const PAYMENT_COLUMNS: &str = "id, uuid, intent_id, payable_type, payable_id, payer_id, \
    payee_id, payment_type, status, amount_minor, fee_minor, net_minor, currency, method, \
    provider, provider_payment_id, payment_method_id, metadata, created_at, updated_at, \
    authorized_at, captured_at, succeeded_at, settled_at, refunded_at, cancelled_at, failed_at";

const REFUND_COLUMNS: &str = "id, uuid, payment_id, amount_minor, currency, reason, status, \
    provider_refund_id, failure_reason, created_at, updated_at, refunded_at";

const LEDGER_COLUMNS: &str = "id, ledger, ledgerable_type, ledgerable_id, payment_id, refund_id, \
    direction, amount_minor, currency, balance_after, occurred_at, metadata, created_at";

const WEBHOOK_COLUMNS: &str = "id, provider, event_id, event_type, payload, signature, status, \
    attempts, metadata, received_at, processed_at";

const SUBSCRIPTION_COLUMNS: &str = "id, uuid, subscriber_id, creator_id, plan_ref, status, \
    auto_renews, ends_at, grace_ends_at, metadata, created_at, updated_at, cancelled_at, expired_at";

const METHOD_COLUMNS: &str = "id, user_id, provider, provider_method_id, brand, last_four, \
    exp_month, exp_year, is_default, last_used_at, created_at, updated_at";

/// Statuses that mean money moved; such payments are never cleaned up
const CAPTURED_STATUSES: [PaymentStatus; 3] = [
    PaymentStatus::Captured,
    PaymentStatus::Settled,
    PaymentStatus::Refunded,
];

fn status_list<T: Copy>(statuses: &[T], as_str: fn(&T) -> &'static str) -> Vec<String> {
    statuses.iter().map(|s| as_str(s).to_string()).collect()
}

fn map_write_error(e: sqlx::Error, what: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(format!("{}: {}", what, db.message()))
        }
        _ => StoreError::Database(e),
    }
}

fn expect_one(rows: u64, kind: &str, id: Uuid) -> StoreResult<()> {
    if rows == 0 {
        return Err(StoreError::NotFound(format!("{} {}", kind, id)));
    }
    Ok(())
}

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct IntentRow {
    id: Uuid,
    uuid: Uuid,
    provider: String,
    provider_intent_id: Option<String>,
    amount_minor: i64,
    currency: String,
    payer_id: i64,
    payee_id: Option<i64>,
    payment_type: String,
    method: String,
    status: String,
    metadata: Json<Metadata>,
    payment_id: Option<Uuid>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    succeeded_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<IntentRow> for PaymentIntent {
    type Error = StoreError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        Ok(PaymentIntent {
            id: row.id,
            uuid: row.uuid,
            provider: row.provider,
            provider_intent_id: row.provider_intent_id,
            amount: Money::new(row.amount_minor, &row.currency)?,
            payer_id: row.payer_id,
            payee_id: row.payee_id,
            payment_type: PaymentType::from_str(&row.payment_type)?,
            method: row.method,
            status: IntentStatus::from_str(&row.status)?,
            metadata: row.metadata.0,
            payment_id: row.payment_id,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            succeeded_at: row.succeeded_at,
            failed_at: row.failed_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    uuid: Uuid,
    intent_id: Option<Uuid>,
    payable_type: String,
    payable_id: i64,
    payer_id: Option<i64>,
    payee_id: Option<i64>,
    payment_type: String,
    status: String,
    amount_minor: i64,
    fee_minor: i64,
    net_minor: i64,
    currency: String,
    method: String,
    provider: String,
    provider_payment_id: Option<String>,
    payment_method_id: Option<Uuid>,
    metadata: Json<Metadata>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    authorized_at: Option<DateTime<Utc>>,
    captured_at: Option<DateTime<Utc>>,
    succeeded_at: Option<DateTime<Utc>>,
    settled_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let currency = Currency::new(&row.currency)?;
        Ok(Payment {
            id: row.id,
            uuid: row.uuid,
            intent_id: row.intent_id,
            payable: Payable::from_parts(&row.payable_type, row.payable_id)?,
            payer_id: row.payer_id,
            payee_id: row.payee_id,
            payment_type: PaymentType::from_str(&row.payment_type)?,
            status: PaymentStatus::from_str(&row.status)?,
            amount: Money::from_minor(row.amount_minor, currency),
            fee_amount: Money::from_minor(row.fee_minor, currency),
            net_amount: Money::from_minor(row.net_minor, currency),
            method: row.method,
            provider: row.provider,
            provider_payment_id: row.provider_payment_id,
            payment_method_id: row.payment_method_id,
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            authorized_at: row.authorized_at,
            captured_at: row.captured_at,
            succeeded_at: row.succeeded_at,
            settled_at: row.settled_at,
            refunded_at: row.refunded_at,
            cancelled_at: row.cancelled_at,
            failed_at: row.failed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    uuid: Uuid,
    payment_id: Uuid,
    amount_minor: i64,
    currency: String,
    reason: String,
    status: String,
    provider_refund_id: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    refunded_at: Option<DateTime<Utc>>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = StoreError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        Ok(Refund {
            id: row.id,
            uuid: row.uuid,
            payment_id: row.payment_id,
            amount: Money::new(row.amount_minor, &row.currency)?,
            reason: row.reason,
            status: RefundStatus::from_str(&row.status)?,
            provider_refund_id: row.provider_refund_id,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            refunded_at: row.refunded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    ledger: String,
    ledgerable_type: String,
    ledgerable_id: i64,
    payment_id: Uuid,
    refund_id: Option<Uuid>,
    direction: String,
    amount_minor: i64,
    currency: String,
    balance_after: Option<i64>,
    occurred_at: DateTime<Utc>,
    metadata: Json<Metadata>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: row.id,
            ledger: row.ledger,
            ledgerable: Ledgerable::from_parts(&row.ledgerable_type, row.ledgerable_id)?,
            payment_id: row.payment_id,
            refund_id: row.refund_id,
            direction: Direction::from_str(&row.direction)?,
            amount: Money::new(row.amount_minor, &row.currency)?,
            balance_after: row.balance_after,
            occurred_at: row.occurred_at,
            metadata: row.metadata.0,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    provider: String,
    event_id: Option<String>,
    event_type: String,
    payload: Vec<u8>,
    signature: Option<String>,
    status: String,
    attempts: i32,
    metadata: Json<Metadata>,
    received_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WebhookRow> for PaymentWebhook {
    type Error = StoreError;

    fn try_from(row: WebhookRow) -> Result<Self, Self::Error> {
        Ok(PaymentWebhook {
            id: row.id,
            provider: row.provider,
            event_id: row.event_id,
            event_type: row.event_type,
            payload: row.payload,
            signature: row.signature,
            status: WebhookStatus::from_str(&row.status)?,
            attempts: row.attempts,
            metadata: row.metadata.0,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    uuid: Uuid,
    subscriber_id: i64,
    creator_id: i64,
    plan_ref: String,
    status: String,
    auto_renews: bool,
    ends_at: DateTime<Utc>,
    grace_ends_at: Option<DateTime<Utc>>,
    metadata: Json<Metadata>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
}

impl TryFrom<SubscriptionRow> for PaymentSubscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(PaymentSubscription {
            id: row.id,
            uuid: row.uuid,
            subscriber_id: row.subscriber_id,
            creator_id: row.creator_id,
            plan_ref: row.plan_ref,
            status: SubscriptionStatus::from_str(&row.status)?,
            auto_renews: row.auto_renews,
            ends_at: row.ends_at,
            grace_ends_at: row.grace_ends_at,
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            cancelled_at: row.cancelled_at,
            expired_at: row.expired_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MethodRow {
    id: Uuid,
    user_id: i64,
    provider: String,
    provider_method_id: String,
    brand: Option<String>,
    last_four: Option<String>,
    exp_month: Option<i32>,
    exp_year: Option<i32>,
    is_default: bool,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MethodRow> for PaymentMethod {
    fn from(row: MethodRow) -> Self {
        PaymentMethod {
            id: row.id,
            user_id: row.user_id,
            provider: row.provider,
            provider_method_id: row.provider_method_id,
            brand: row.brand,
            last_four: row.last_four,
            exp_month: row.exp_month,
            exp_year: row.exp_year,
            is_default: row.is_default,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PaymentStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_intent(&self, id: Uuid) -> StoreResult<Option<PaymentIntent>> {
        let sql = format!("SELECT {} FROM payment_intents WHERE id = $1", INTENT_COLUMNS);
        sqlx::query_as::<_, IntentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(PaymentIntent::try_from)
            .transpose()
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn find_payment_by_provider_ref(
        &self,
        provider: &str,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE provider = $1 AND provider_payment_id = $2 \
             ORDER BY created_at LIMIT 1",
            PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(provider)
            .bind(provider_payment_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn list_refunds(&self, payment_id: Uuid) -> StoreResult<Vec<Refund>> {
        let sql = format!(
            "SELECT {} FROM payment_refunds WHERE payment_id = $1 ORDER BY created_at",
            REFUND_COLUMNS
        );
        let rows = sqlx::query_as::<_, RefundRow>(&sql)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_ledger_entries(&self, payment_id: Uuid) -> StoreResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE payment_id = $1 ORDER BY created_at, id",
            LEDGER_COLUMNS
        );
        let rows = sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn unposted_capture_ids(&self, limit: i64) -> StoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT p.id FROM payments p
            WHERE p.status IN ('captured', 'settled', 'refunded')
              AND (
                (p.payee_id IS NOT NULL AND p.net_minor > 0 AND NOT EXISTS (
                    SELECT 1 FROM ledger_entries e
                    WHERE e.payment_id = p.id AND e.refund_id IS NULL AND e.direction = 'credit'))
                OR (p.payer_id IS NOT NULL AND NOT EXISTS (
                    SELECT 1 FROM ledger_entries e
                    WHERE e.payment_id = p.id AND e.refund_id IS NULL AND e.direction = 'debit'))
              )
            ORDER BY p.captured_at NULLS FIRST, p.id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn unposted_refund_ids(&self, limit: i64) -> StoreResult<Vec<(Uuid, Uuid)>> {
        let ids = sqlx::query_as::<_, (Uuid, Uuid)>(
            r#"
            SELECT r.payment_id, r.id FROM payment_refunds r
            JOIN payments p ON p.id = r.payment_id
            WHERE r.status = 'succeeded'
              AND (
                (p.payee_id IS NOT NULL AND NOT EXISTS (
                    SELECT 1 FROM ledger_entries e
                    WHERE e.refund_id = r.id AND e.direction = 'debit'))
                OR (p.payer_id IS NOT NULL AND NOT EXISTS (
                    SELECT 1 FROM ledger_entries e
                    WHERE e.refund_id = r.id AND e.direction = 'credit'))
              )
            ORDER BY r.refunded_at NULLS FIRST, r.id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn get_webhook(&self, id: Uuid) -> StoreResult<Option<PaymentWebhook>> {
        let sql = format!("SELECT {} FROM payment_webhooks WHERE id = $1", WEBHOOK_COLUMNS);
        sqlx::query_as::<_, WebhookRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(PaymentWebhook::try_from)
            .transpose()
    }

    async fn count_webhooks(&self, provider: &str) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM payment_webhooks WHERE provider = $1",
        )
        .bind(provider)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn pending_webhook_ids(
        &self,
        received_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM payment_webhooks
            WHERE status = 'pending' AND received_at < $1
            ORDER BY received_at
            LIMIT $2
            "#,
        )
        .bind(received_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<PaymentSubscription>> {
        let sql = format!(
            "SELECT {} FROM payment_subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(PaymentSubscription::try_from)
            .transpose()
    }

    async fn due_subscription_ids(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM payment_subscriptions
            WHERE (status IN ('active', 'trialing') AND ends_at <= $1)
               OR (status = 'grace' AND grace_ends_at <= $1)
            ORDER BY ends_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn reminder_candidate_ids(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM (
                SELECT id, metadata,
                       CASE WHEN status = 'grace' THEN grace_ends_at ELSE ends_at END AS boundary
                FROM payment_subscriptions
                WHERE (status IN ('active', 'trialing') AND auto_renews)
                   OR status = 'grace'
            ) candidates
            WHERE boundary > $1 AND boundary <= $2
              AND (metadata->>'last_renewal_reminder_period_end')::timestamptz
                  IS DISTINCT FROM boundary
            ORDER BY boundary, id
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_payment_methods(&self, user_id: i64) -> StoreResult<Vec<PaymentMethod>> {
        let sql = format!(
            "SELECT {} FROM payment_methods WHERE user_id = $1 ORDER BY created_at",
            METHOD_COLUMNS
        );
        let rows = sqlx::query_as::<_, MethodRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PaymentMethod::from).collect())
    }
}

// ============================================================================
// Transaction
// ============================================================================

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_intent(&mut self, intent: &PaymentIntent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_intents
                (id, uuid, provider, provider_intent_id, amount_minor, currency, payer_id,
                 payee_id, payment_type, method, status, metadata, payment_id, expires_at,
                 created_at, updated_at, succeeded_at, failed_at, cancelled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19)
            "#,
        )
        .bind(intent.id)
        .bind(intent.uuid)
        .bind(&intent.provider)
        .bind(&intent.provider_intent_id)
        .bind(intent.amount.amount_minor)
        .bind(intent.amount.currency.as_str())
        .bind(intent.payer_id)
        .bind(intent.payee_id)
        .bind(intent.payment_type.as_str())
        .bind(&intent.method)
        .bind(intent.status.as_str())
        .bind(Json(&intent.metadata))
        .bind(intent.payment_id)
        .bind(intent.expires_at)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .bind(intent.succeeded_at)
        .bind(intent.failed_at)
        .bind(intent.cancelled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(e, "insert intent"))?;
        Ok(())
    }

    async fn lock_intent(&mut self, id: Uuid) -> StoreResult<Option<PaymentIntent>> {
        let sql = format!(
            "SELECT {} FROM payment_intents WHERE id = $1 FOR UPDATE",
            INTENT_COLUMNS
        );
        sqlx::query_as::<_, IntentRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(PaymentIntent::try_from)
            .transpose()
    }

    async fn update_intent(&mut self, intent: &PaymentIntent) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payment_intents
            SET provider_intent_id = $2, status = $3, metadata = $4, payment_id = $5,
                expires_at = $6, updated_at = $7, succeeded_at = $8, failed_at = $9,
                cancelled_at = $10
            WHERE id = $1
            "#,
        )
        .bind(intent.id)
        .bind(&intent.provider_intent_id)
        .bind(intent.status.as_str())
        .bind(Json(&intent.metadata))
        .bind(intent.payment_id)
        .bind(intent.expires_at)
        .bind(intent.updated_at)
        .bind(intent.succeeded_at)
        .bind(intent.failed_at)
        .bind(intent.cancelled_at)
        .execute(&mut *self.tx)
        .await?;
        expect_one(result.rows_affected(), "intent", intent.id)
    }

    async fn lock_expirable_intents(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentIntent>> {
        let sql = format!(
            "SELECT {} FROM payment_intents \
             WHERE status = ANY($1) AND expires_at IS NOT NULL AND expires_at <= $2 \
             ORDER BY expires_at LIMIT $3 FOR UPDATE SKIP LOCKED",
            INTENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(status_list(&IntentStatus::EXPIRABLE, IntentStatus::as_str))
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;
        convert_all(rows)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments
                (id, uuid, intent_id, payable_type, payable_id, payer_id, payee_id,
                 payment_type, status, amount_minor, fee_minor, net_minor, currency, method,
                 provider, provider_payment_id, payment_method_id, metadata, created_at,
                 updated_at, authorized_at, captured_at, succeeded_at, settled_at,
                 refunded_at, cancelled_at, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)
            "#,
        )
        .bind(payment.id)
        .bind(payment.uuid)
        .bind(payment.intent_id)
        .bind(payment.payable.kind().as_str())
        .bind(payment.payable.id())
        .bind(payment.payer_id)
        .bind(payment.payee_id)
        .bind(payment.payment_type.as_str())
        .bind(payment.status.as_str())
        .bind(payment.amount.amount_minor)
        .bind(payment.fee_amount.amount_minor)
        .bind(payment.net_amount.amount_minor)
        .bind(payment.currency().as_str())
        .bind(&payment.method)
        .bind(&payment.provider)
        .bind(&payment.provider_payment_id)
        .bind(payment.payment_method_id)
        .bind(Json(&payment.metadata))
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .bind(payment.authorized_at)
        .bind(payment.captured_at)
        .bind(payment.succeeded_at)
        .bind(payment.settled_at)
        .bind(payment.refunded_at)
        .bind(payment.cancelled_at)
        .bind(payment.failed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(e, "insert payment"))?;
        Ok(())
    }

    async fn lock_payment(&mut self, id: Uuid) -> StoreResult<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE id = $1 FOR UPDATE", PAYMENT_COLUMNS);
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn update_payment(&mut self, payment: &Payment) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET intent_id = $2, status = $3, provider_payment_id = $4, payment_method_id = $5,
                metadata = $6, updated_at = $7, authorized_at = $8, captured_at = $9,
                succeeded_at = $10, settled_at = $11, refunded_at = $12, cancelled_at = $13,
                failed_at = $14
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(payment.intent_id)
        .bind(payment.status.as_str())
        .bind(&payment.provider_payment_id)
        .bind(payment.payment_method_id)
        .bind(Json(&payment.metadata))
        .bind(payment.updated_at)
        .bind(payment.authorized_at)
        .bind(payment.captured_at)
        .bind(payment.succeeded_at)
        .bind(payment.settled_at)
        .bind(payment.refunded_at)
        .bind(payment.cancelled_at)
        .bind(payment.failed_at)
        .execute(&mut *self.tx)
        .await?;
        expect_one(result.rows_affected(), "payment", payment.id)
    }

    async fn lock_stale_pending_payments(
        &mut self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments \
             WHERE status = 'pending' AND intent_id IS NULL AND created_at < $1 \
             ORDER BY created_at LIMIT $2 FOR UPDATE SKIP LOCKED",
            PAYMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(created_before)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;
        convert_all(rows)
    }

    async fn insert_refund(&mut self, refund: &Refund) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_refunds
                (id, uuid, payment_id, amount_minor, currency, reason, status,
                 provider_refund_id, failure_reason, created_at, updated_at, refunded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(refund.id)
        .bind(refund.uuid)
        .bind(refund.payment_id)
        .bind(refund.amount.amount_minor)
        .bind(refund.amount.currency.as_str())
        .bind(&refund.reason)
        .bind(refund.status.as_str())
        .bind(&refund.provider_refund_id)
        .bind(&refund.failure_reason)
        .bind(refund.created_at)
        .bind(refund.updated_at)
        .bind(refund.refunded_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(e, "insert refund"))?;
        Ok(())
    }

    async fn update_refund(&mut self, refund: &Refund) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payment_refunds
            SET status = $2, provider_refund_id = $3, failure_reason = $4, updated_at = $5,
                refunded_at = $6
            WHERE id = $1
            "#,
        )
        .bind(refund.id)
        .bind(refund.status.as_str())
        .bind(&refund.provider_refund_id)
        .bind(&refund.failure_reason)
        .bind(refund.updated_at)
        .bind(refund.refunded_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(e, "update refund"))?;
        expect_one(result.rows_affected(), "refund", refund.id)
    }

    async fn refunds_for_payment(&mut self, payment_id: Uuid) -> StoreResult<Vec<Refund>> {
        let sql = format!(
            "SELECT {} FROM payment_refunds WHERE payment_id = $1 ORDER BY created_at",
            REFUND_COLUMNS
        );
        let rows = sqlx::query_as::<_, RefundRow>(&sql)
            .bind(payment_id)
            .fetch_all(&mut *self.tx)
            .await?;
        convert_all(rows)
    }

    async fn ledger_entry_exists(
        &mut self,
        payment_id: Uuid,
        refund_id: Option<Uuid>,
        direction: Direction,
    ) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM ledger_entries
                WHERE payment_id = $1 AND refund_id IS NOT DISTINCT FROM $2 AND direction = $3
            )
            "#,
        )
        .bind(payment_id)
        .bind(refund_id)
        .bind(direction.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, ledger, ledgerable_type, ledgerable_id, payment_id, refund_id, direction,
                 amount_minor, currency, balance_after, occurred_at, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.ledger)
        .bind(entry.ledgerable.kind())
        .bind(entry.ledgerable.id())
        .bind(entry.payment_id)
        .bind(entry.refund_id)
        .bind(entry.direction.as_str())
        .bind(entry.amount.amount_minor)
        .bind(entry.amount.currency.as_str())
        .bind(entry.balance_after)
        .bind(entry.occurred_at)
        .bind(Json(&entry.metadata))
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(e, "insert ledger entry"))?;
        Ok(())
    }

    async fn insert_webhook(&mut self, webhook: &PaymentWebhook) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_webhooks
                (id, provider, event_id, event_type, payload, signature, status, attempts,
                 metadata, received_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(webhook.id)
        .bind(&webhook.provider)
        .bind(&webhook.event_id)
        .bind(&webhook.event_type)
        .bind(&webhook.payload)
        .bind(&webhook.signature)
        .bind(webhook.status.as_str())
        .bind(webhook.attempts)
        .bind(Json(&webhook.metadata))
        .bind(webhook.received_at)
        .bind(webhook.processed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_webhook(&mut self, id: Uuid) -> StoreResult<Option<PaymentWebhook>> {
        let sql = format!(
            "SELECT {} FROM payment_webhooks WHERE id = $1 FOR UPDATE",
            WEBHOOK_COLUMNS
        );
        sqlx::query_as::<_, WebhookRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(PaymentWebhook::try_from)
            .transpose()
    }

    async fn update_webhook(&mut self, webhook: &PaymentWebhook) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payment_webhooks
            SET event_id = $2, event_type = $3, status = $4, attempts = $5, metadata = $6,
                processed_at = $7
            WHERE id = $1
            "#,
        )
        .bind(webhook.id)
        .bind(&webhook.event_id)
        .bind(&webhook.event_type)
        .bind(webhook.status.as_str())
        .bind(webhook.attempts)
        .bind(Json(&webhook.metadata))
        .bind(webhook.processed_at)
        .execute(&mut *self.tx)
        .await?;
        expect_one(result.rows_affected(), "webhook", webhook.id)
    }

    async fn find_processed_webhook(
        &mut self,
        provider: &str,
        event_id: &str,
        exclude: Uuid,
    ) -> StoreResult<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM payment_webhooks
            WHERE provider = $1 AND event_id = $2 AND status = 'processed' AND id <> $3
            ORDER BY processed_at
            LIMIT 1
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .bind(exclude)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_subscription(
        &mut self,
        subscription: &PaymentSubscription,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_subscriptions
                (id, uuid, subscriber_id, creator_id, plan_ref, status, auto_renews, ends_at,
                 grace_ends_at, metadata, created_at, updated_at, cancelled_at, expired_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.uuid)
        .bind(subscription.subscriber_id)
        .bind(subscription.creator_id)
        .bind(&subscription.plan_ref)
        .bind(subscription.status.as_str())
        .bind(subscription.auto_renews)
        .bind(subscription.ends_at)
        .bind(subscription.grace_ends_at)
        .bind(Json(&subscription.metadata))
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .bind(subscription.cancelled_at)
        .bind(subscription.expired_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(e, "insert subscription"))?;
        Ok(())
    }

    async fn lock_subscription(&mut self, id: Uuid) -> StoreResult<Option<PaymentSubscription>> {
        let sql = format!(
            "SELECT {} FROM payment_subscriptions WHERE id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(PaymentSubscription::try_from)
            .transpose()
    }

    async fn update_subscription(
        &mut self,
        subscription: &PaymentSubscription,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payment_subscriptions
            SET status = $2, auto_renews = $3, ends_at = $4, grace_ends_at = $5, metadata = $6,
                updated_at = $7, cancelled_at = $8, expired_at = $9
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.status.as_str())
        .bind(subscription.auto_renews)
        .bind(subscription.ends_at)
        .bind(subscription.grace_ends_at)
        .bind(Json(&subscription.metadata))
        .bind(subscription.updated_at)
        .bind(subscription.cancelled_at)
        .bind(subscription.expired_at)
        .execute(&mut *self.tx)
        .await?;
        expect_one(result.rows_affected(), "subscription", subscription.id)
    }

    async fn insert_payment_method(&mut self, method: &PaymentMethod) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_methods
                (id, user_id, provider, provider_method_id, brand, last_four, exp_month,
                 exp_year, is_default, last_used_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(method.id)
        .bind(method.user_id)
        .bind(&method.provider)
        .bind(&method.provider_method_id)
        .bind(&method.brand)
        .bind(&method.last_four)
        .bind(method.exp_month)
        .bind(method.exp_year)
        .bind(method.is_default)
        .bind(method.last_used_at)
        .bind(method.created_at)
        .bind(method.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(e, "insert payment method"))?;
        Ok(())
    }

    async fn lock_payment_methods_for_user(
        &mut self,
        user_id: i64,
    ) -> StoreResult<Vec<PaymentMethod>> {
        let sql = format!(
            "SELECT {} FROM payment_methods WHERE user_id = $1 ORDER BY created_at FOR UPDATE",
            METHOD_COLUMNS
        );
        let rows = sqlx::query_as::<_, MethodRow>(&sql)
            .bind(user_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(PaymentMethod::from).collect())
    }

    async fn update_payment_method(&mut self, method: &PaymentMethod) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payment_methods
            SET brand = $2, last_four = $3, exp_month = $4, exp_year = $5, is_default = $6,
                last_used_at = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(method.id)
        .bind(&method.brand)
        .bind(&method.last_four)
        .bind(method.exp_month)
        .bind(method.exp_year)
        .bind(method.is_default)
        .bind(method.last_used_at)
        .bind(method.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(e, "update payment method"))?;
        expect_one(result.rows_affected(), "payment method", method.id)
    }

    async fn delete_payment_method(&mut self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM payment_methods WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_terminal_intents(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM payment_intents
            WHERE id IN (
                SELECT id FROM payment_intents
                WHERE status = ANY($1) AND updated_at < $2
                ORDER BY updated_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(status_list(&IntentStatus::TERMINAL, IntentStatus::as_str))
        .bind(cutoff)
        .bind(limit)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_orphan_payments(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM payments
            WHERE id IN (
                SELECT p.id FROM payments p
                WHERE p.status <> ALL($1)
                  AND p.created_at < $2
                  AND NOT EXISTS (SELECT 1 FROM ledger_entries e WHERE e.payment_id = p.id)
                  AND NOT EXISTS (SELECT 1 FROM payment_refunds r WHERE r.payment_id = p.id)
                  AND NOT EXISTS (SELECT 1 FROM payment_intents i WHERE i.payment_id = p.id)
                ORDER BY p.created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(status_list(&CAPTURED_STATUSES, PaymentStatus::as_str))
        .bind(cutoff)
        .bind(limit)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
