//! Inbound event types for Fanout.
//!
//! An inbound event is one message a transport received for one topic.
//! Events are transient and routed at most once.

use fanout_protocol::EventEnvelope;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique event identifier.
pub type EventId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Generate a unique event ID.
#[must_use]
pub fn generate_event_id() -> EventId {
    // Combine timestamp with atomic counter for guaranteed uniqueness
    let timestamp = now().as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// A message received from a transport for one topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// Topic the event was delivered on.
    pub topic: String,
    /// Decoded JSON payload.
    pub payload: Value,
    /// Identity of the publisher, when the transport reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Transport-assigned ordering token, when the transport has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timetoken: Option<String>,
    /// Milliseconds since the epoch when the event was received.
    pub received_at: u64,
}

impl InboundEvent {
    /// Create a new event.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: generate_event_id(),
            topic: topic.into(),
            payload,
            publisher: None,
            timetoken: None,
            received_at: now().as_millis() as u64,
        }
    }

    /// Set the publisher identity.
    #[must_use]
    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    /// Set the transport timetoken.
    #[must_use]
    pub fn with_timetoken(mut self, timetoken: impl Into<String>) -> Self {
        self.timetoken = Some(timetoken.into());
        self
    }
}

impl From<EventEnvelope> for InboundEvent {
    fn from(mut envelope: EventEnvelope) -> Self {
        let timetoken = envelope.timetoken.take();
        let (topic, payload, publisher) = envelope.into_parts();
        let mut event = InboundEvent::new(topic, payload);
        event.publisher = publisher;
        event.timetoken = timetoken;
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_creation() {
        let event = InboundEvent::new("room.1", json!({"text": "hi"}));
        assert_eq!(event.topic, "room.1");
        assert_eq!(event.payload, json!({"text": "hi"}));
        assert!(event.publisher.is_none());
        assert!(event.received_at > 0);
    }

    #[test]
    fn test_event_from_envelope() {
        let envelope = EventEnvelope::new("room.1", json!(42)).with_publisher("user-1");
        let event = InboundEvent::from(envelope);
        assert_eq!(event.topic, "room.1");
        assert_eq!(event.payload, json!(42));
        assert_eq!(event.publisher.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_unique_event_ids() {
        let id1 = generate_event_id();
        let id2 = generate_event_id();
        assert_ne!(id1, id2);
    }
}
