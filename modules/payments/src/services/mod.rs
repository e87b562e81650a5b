//! Domain services of the payments core

pub mod cleanup;
pub mod ledger_poster;
pub mod payment_method_service;
pub mod payment_service;
pub mod subscription_service;
pub mod webhook_service;

pub use cleanup::{CleanupService, CleanupSummary};
pub use ledger_poster::{LedgerPoster, ReconcileSummary};
pub use payment_method_service::PaymentMethodService;
pub use payment_service::{
    CaptureData, CreateIntentRequest, ExpirySummary, PaymentService, RecordPaymentRequest,
    RefundData,
};
pub use subscription_service::{CreateSubscriptionRequest, SubscriptionService};
pub use webhook_service::{ProcessOutcome, WebhookIngestor, WebhookProcessor, UNKNOWN_EVENT_TYPE};
