//! # Event Envelope
//!
//! Metadata wrapped around every published event.
//!
//! - `event_id`: unique identifier, usable by listeners as an idempotency key
//! - `subject`: routing key the event was published under
//! - `occurred_at`: when the event was published
//! - `source_module`: module that produced the event
//! - `correlation_id`: links related events in a business transaction
//! - `payload`: the typed event

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Event;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,

    pub subject: String,

    pub occurred_at: DateTime<Utc>,

    pub source_module: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    pub payload: T,
}

impl<T: Event> EventEnvelope<T> {
    /// Wrap an event with a fresh event_id and the current timestamp
    pub fn new(source_module: impl Into<String>, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            subject: payload.subject().to_string(),
            occurred_at: Utc::now(),
            source_module: source_module.into(),
            correlation_id: None,
            payload,
        }
    }

    /// Set the correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Ping(u32);

    impl Event for Ping {
        fn subject(&self) -> &'static str {
            "test.ping"
        }
    }

    #[test]
    fn test_envelope_takes_subject_from_payload() {
        let envelope = EventEnvelope::new("tests", Ping(1));
        assert_eq!(envelope.subject, "test.ping");
        assert_eq!(envelope.source_module, "tests");
        assert!(envelope.correlation_id.is_none());
    }

    #[test]
    fn test_envelope_serializes_without_empty_correlation() {
        let envelope = EventEnvelope::new("tests", Ping(2));
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("correlation_id").is_none());
        assert_eq!(json["payload"], serde_json::json!(2));

        let with_corr = envelope.with_correlation_id(Some("corr-1".to_string()));
        let json = serde_json::to_value(&with_corr).unwrap();
        assert_eq!(json["correlation_id"], "corr-1");
    }
}
