//! In-process implementation of the EventBus trait

use crate::consumer_retry::{retry_with_backoff_if, RetryConfig};
use crate::subject::{subject_matches, validate_pattern};
use crate::{
    BusError, BusResult, Event, EventBus, EventEnvelope, EventHandler, HandlerError,
    SubscriptionId,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

struct Subscription<E: Event> {
    id: SubscriptionId,
    pattern: String,
    handler: Arc<dyn EventHandler<E>>,
}

/// EventBus implementation that dispatches to registered handlers in-process
///
/// Handlers run sequentially in subscription order. Each handler gets its own
/// retry budget for transient failures; one handler failing does not stop the
/// others from seeing the event.
pub struct InMemoryBus<E: Event> {
    source_module: String,
    retry: RetryConfig,
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription<E>>>,
}

impl<E: Event> InMemoryBus<E> {
    /// Create a new bus; `source_module` is stamped on every envelope.
    pub fn new(source_module: impl Into<String>) -> Self {
        Self::with_retry(source_module, RetryConfig::default())
    }

    /// Create a bus with a custom handler retry policy
    pub fn with_retry(source_module: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            source_module: source_module.into(),
            retry,
            next_id: AtomicU64::new(1),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .map(|subs| subs.len())
            .unwrap_or_default()
    }

    fn matching_handlers(&self, subject: &str) -> BusResult<Vec<Arc<dyn EventHandler<E>>>> {
        let subs = self
            .subscriptions
            .read()
            .map_err(|e| BusError::InternalError(format!("subscription lock poisoned: {}", e)))?;

        Ok(subs
            .iter()
            .filter(|s| subject_matches(subject, &s.pattern))
            .map(|s| s.handler.clone())
            .collect())
    }
}

#[async_trait]
impl<E: Event> EventBus<E> for InMemoryBus<E> {
    async fn publish(&self, event: E) -> BusResult<EventEnvelope<E>> {
        let envelope = EventEnvelope::new(self.source_module.clone(), event);
        let handlers = self.matching_handlers(&envelope.subject)?;

        tracing::debug!(
            event_id = %envelope.event_id,
            subject = %envelope.subject,
            handlers = handlers.len(),
            "Publishing event"
        );

        for handler in handlers {
            let context = format!("{}:{}", handler.name(), envelope.subject);
            let result = retry_with_backoff_if(
                || handler.handle(&envelope),
                &self.retry,
                &context,
                |e: &HandlerError| e.is_transient(),
            )
            .await;

            if let Err(e) = result {
                tracing::error!(
                    event_id = %envelope.event_id,
                    subject = %envelope.subject,
                    handler = handler.name(),
                    error = %e,
                    "Event handler failed"
                );
            }
        }

        Ok(envelope)
    }

    fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler<E>>,
    ) -> BusResult<SubscriptionId> {
        validate_pattern(pattern)?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self
            .subscriptions
            .write()
            .map_err(|e| BusError::InternalError(format!("subscription lock poisoned: {}", e)))?;

        tracing::debug!(pattern = %pattern, handler = handler.name(), "Handler subscribed");

        subs.push(Subscription {
            id,
            pattern: pattern.to_string(),
            handler,
        });

        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = match self.subscriptions.write() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Created(u32),
        Deleted(u32),
    }

    impl Event for TestEvent {
        fn subject(&self) -> &'static str {
            match self {
                TestEvent::Created(_) => "test.events.created",
                TestEvent::Deleted(_) => "test.events.deleted",
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<TestEvent>>,
    }

    #[async_trait]
    impl EventHandler<TestEvent> for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn handle(&self, envelope: &EventEnvelope<TestEvent>) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(envelope.payload.clone());
            Ok(())
        }
    }

    struct Flaky {
        failures_left: Mutex<u32>,
        calls: Mutex<u32>,
        permanent: bool,
    }

    #[async_trait]
    impl EventHandler<TestEvent> for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle(&self, _envelope: &EventEnvelope<TestEvent>) -> Result<(), HandlerError> {
            *self.calls.lock().unwrap() += 1;
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                if self.permanent {
                    return Err(HandlerError::permanent("boom"));
                }
                return Err(HandlerError::transient("try again"));
            }
            Ok(())
        }
    }

    fn fast_bus() -> InMemoryBus<TestEvent> {
        InMemoryBus::with_retry(
            "tests",
            RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_handlers_only() {
        let bus = fast_bus();
        let created = Arc::new(Recorder::default());
        let all = Arc::new(Recorder::default());

        bus.subscribe("test.events.created", created.clone()).unwrap();
        bus.subscribe("test.>", all.clone()).unwrap();

        bus.publish(TestEvent::Created(1)).await.unwrap();
        bus.publish(TestEvent::Deleted(2)).await.unwrap();

        assert_eq!(*created.seen.lock().unwrap(), vec![TestEvent::Created(1)]);
        assert_eq!(
            *all.seen.lock().unwrap(),
            vec![TestEvent::Created(1), TestEvent::Deleted(2)]
        );
    }

    #[tokio::test]
    async fn test_envelope_carries_source_and_subject() {
        let bus = fast_bus();
        let envelope = bus.publish(TestEvent::Deleted(9)).await.unwrap();
        assert_eq!(envelope.source_module, "tests");
        assert_eq!(envelope.subject, "test.events.deleted");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let bus = fast_bus();
        let flaky = Arc::new(Flaky {
            failures_left: Mutex::new(2),
            calls: Mutex::new(0),
            permanent: false,
        });
        bus.subscribe("test.>", flaky.clone()).unwrap();

        bus.publish(TestEvent::Created(1)).await.unwrap();

        assert_eq!(*flaky.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_block_other_handlers() {
        let bus = fast_bus();
        let broken = Arc::new(Flaky {
            failures_left: Mutex::new(10),
            calls: Mutex::new(0),
            permanent: true,
        });
        let recorder = Arc::new(Recorder::default());
        bus.subscribe("test.>", broken.clone()).unwrap();
        bus.subscribe("test.>", recorder.clone()).unwrap();

        let result = bus.publish(TestEvent::Created(5)).await;

        assert!(result.is_ok(), "handler failure must not reach the publisher");
        assert_eq!(*broken.calls.lock().unwrap(), 1);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = fast_bus();
        let recorder = Arc::new(Recorder::default());
        let id = bus.subscribe("test.>", recorder.clone()).unwrap();
        assert_eq!(bus.subscription_count(), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(TestEvent::Created(1)).await.unwrap();
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let bus = fast_bus();
        let recorder = Arc::new(Recorder::default());
        assert!(bus.subscribe("test..x", recorder).is_err());
    }
}
