//! Background work: the webhook queue consumer and the periodic sweeps

pub mod scheduler;
pub mod webhook_worker;

pub use scheduler::{Scheduler, SchedulerConfig};
pub use webhook_worker::{webhook_queue, WebhookWorker, WEBHOOK_QUEUE_CAPACITY};
