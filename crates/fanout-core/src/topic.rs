//! Topic abstraction for Fanout.
//!
//! A topic is a named logical channel sharing one physical connection with
//! every other topic. Each topic owns a multicast stream that fans inbound
//! events out to all of its attached consumers.

use crate::event::InboundEvent;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 256;

/// Default multicast stream capacity.
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

/// A topic identifier.
pub type TopicName = String;

/// The receiving side of a topic's multicast stream.
pub type TopicStream = broadcast::Receiver<Arc<InboundEvent>>;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("Topic name too long");
    }
    if name.contains(',') {
        return Err("Topic name cannot contain ','");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic name contains invalid characters");
    }
    Ok(())
}

/// A registry entry for one topic.
#[derive(Debug)]
pub struct Topic {
    /// Topic name.
    name: TopicName,
    /// Broadcast sender; dropping it ends every attached stream.
    sender: broadcast::Sender<Arc<InboundEvent>>,
    /// Number of live consumer bindings.
    consumers: usize,
    /// Incarnation number of this entry.
    epoch: u64,
    /// Whether the transport accepted the subscribe request.
    transport_subscribed: bool,
}

impl Topic {
    /// Create a new topic with a specific stream capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<TopicName>, epoch: u64, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            consumers: 0,
            epoch,
            transport_subscribed: false,
        }
    }

    /// Get the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the incarnation number of this entry.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Get the number of live consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers
    }

    /// Whether the transport accepted a subscribe request for this topic.
    #[must_use]
    pub fn is_transport_subscribed(&self) -> bool {
        self.transport_subscribed
    }

    /// Record the outcome of a transport subscribe request.
    pub fn set_transport_subscribed(&mut self, subscribed: bool) {
        self.transport_subscribed = subscribed;
    }

    /// Open a new view of the multicast stream.
    ///
    /// The view only sees events delivered after this call.
    #[must_use]
    pub fn stream(&self) -> TopicStream {
        self.sender.subscribe()
    }

    /// Add a consumer, returning the new count.
    pub fn increment(&mut self) -> usize {
        self.consumers += 1;
        self.consumers
    }

    /// Remove a consumer, returning the new count.
    ///
    /// The count never goes below zero.
    pub fn decrement(&mut self) -> usize {
        if self.consumers == 0 {
            warn!(topic = %self.name, "Consumer count already zero; ignoring decrement");
            return 0;
        }
        self.consumers -= 1;
        self.consumers
    }

    /// Deliver an event to every attached stream.
    ///
    /// Returns the number of streams that received the event.
    pub fn deliver(&self, event: Arc<InboundEvent>) -> usize {
        trace!(topic = %self.name, "Delivering event");
        self.sender.send(event).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_creation() {
        let topic = Topic::with_capacity("room.1", 7, DEFAULT_STREAM_CAPACITY);
        assert_eq!(topic.name(), "room.1");
        assert_eq!(topic.epoch(), 7);
        assert_eq!(topic.consumer_count(), 0);
        assert_eq!(topic.consumer_count(), 0);
        assert!(!topic.is_transport_subscribed());
    }

    #[test]
    fn test_topic_count_never_negative() {
        let mut topic = Topic::with_capacity("room.1", 1, 8);

        assert_eq!(topic.increment(), 1);
        assert_eq!(topic.increment(), 2);
        assert_eq!(topic.decrement(), 1);
        assert_eq!(topic.decrement(), 0);
        assert_eq!(topic.decrement(), 0);
        assert_eq!(topic.consumer_count(), 0);
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("room.1").is_ok());
        assert!(validate_topic_name("global:conferences.acct-worker").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a,b").is_err());
        assert!(validate_topic_name("tab\there").is_err());

        let long_name = "a".repeat(MAX_TOPIC_NAME_LENGTH + 1);
        assert!(validate_topic_name(&long_name).is_err());
    }

    #[tokio::test]
    async fn test_topic_deliver_fans_out() {
        let topic = Topic::with_capacity("room.1", 1, 8);
        let mut rx1 = topic.stream();
        let mut rx2 = topic.stream();

        let count = topic.deliver(Arc::new(InboundEvent::new("room.1", json!("hi"))));
        assert_eq!(count, 2);

        assert_eq!(rx1.recv().await.unwrap().payload, json!("hi"));
        assert_eq!(rx2.recv().await.unwrap().payload, json!("hi"));
    }

    #[test]
    fn test_deliver_without_streams() {
        let topic = Topic::with_capacity("room.1", 1, 8);
        assert_eq!(topic.deliver(Arc::new(InboundEvent::new("room.1", json!(1)))), 0);
    }
}
