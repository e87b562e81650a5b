pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod listeners;
pub mod models;
pub mod money;
pub mod routes;
pub mod services;
pub mod store;
pub mod worker;

use std::sync::Arc;

use axum::Router;
use event_bus::{BusResult, EventBus};
use tokio::sync::mpsc;
use uuid::Uuid;

use config::Config;
use events::{PaymentBus, SUBJECT_PAYMENT_CAPTURED, SUBJECT_PAYMENT_REFUNDED};
use gateway::PaymentGatewayManager;
use listeners::activity_log::{ActivityLog, ACTIVITY_PATTERN};
use routes::AppState;
use services::{
    CleanupService, LedgerPoster, PaymentMethodService, PaymentService, SubscriptionService,
    WebhookIngestor, WebhookProcessor,
};
use store::PaymentStore;
use worker::{Scheduler, SchedulerConfig};

/// Every service of the payments core wired over one store, gateway registry
/// and bus. The ledger poster and activity log are subscribed on creation.
#[derive(Clone)]
pub struct PaymentsContext {
    pub store: Arc<dyn PaymentStore>,
    pub gateways: Arc<PaymentGatewayManager>,
    pub bus: PaymentBus,
    pub payments: Arc<PaymentService>,
    pub subscriptions: Arc<SubscriptionService>,
    pub payment_methods: Arc<PaymentMethodService>,
    pub cleanup: Arc<CleanupService>,
    pub ingestor: Arc<WebhookIngestor>,
    pub processor: Arc<WebhookProcessor>,
    pub ledger: Arc<LedgerPoster>,
    webhook_queue: Option<mpsc::Sender<Uuid>>,
}

impl PaymentsContext {
    pub fn new(
        config: &Config,
        store: Arc<dyn PaymentStore>,
        gateways: Arc<PaymentGatewayManager>,
        bus: PaymentBus,
        webhook_queue: Option<mpsc::Sender<Uuid>>,
    ) -> BusResult<Self> {
        let payments = Arc::new(PaymentService::new(
            store.clone(),
            gateways.clone(),
            bus.clone(),
            config.platform_fee_bps,
            config.intent_ttl,
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            store.clone(),
            bus.clone(),
            config.subscription_grace,
            config.reminder_lookahead,
        ));
        let payment_methods = Arc::new(PaymentMethodService::new(store.clone(), gateways.clone()));
        let cleanup = Arc::new(CleanupService::new(store.clone()));
        let ingestor = Arc::new(WebhookIngestor::new(
            store.clone(),
            gateways.clone(),
            webhook_queue.clone(),
        ));
        let processor = Arc::new(WebhookProcessor::new(
            store.clone(),
            gateways.clone(),
            payments.clone(),
        ));

        let ledger = Arc::new(LedgerPoster::new(store.clone()));
        bus.subscribe(SUBJECT_PAYMENT_CAPTURED, ledger.clone())?;
        bus.subscribe(SUBJECT_PAYMENT_REFUNDED, ledger.clone())?;
        bus.subscribe(ACTIVITY_PATTERN, Arc::new(ActivityLog))?;

        Ok(Self {
            store,
            gateways,
            bus,
            payments,
            subscriptions,
            payment_methods,
            cleanup,
            ingestor,
            processor,
            ledger,
            webhook_queue,
        })
    }

    pub fn router(&self) -> Router {
        routes::router(AppState {
            ingestor: self.ingestor.clone(),
            store: self.store.clone(),
        })
    }

    pub fn scheduler(&self, config: SchedulerConfig) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.payments.clone(),
            self.subscriptions.clone(),
            self.cleanup.clone(),
            self.ledger.clone(),
            self.webhook_queue.clone(),
            config,
        )
    }
}
