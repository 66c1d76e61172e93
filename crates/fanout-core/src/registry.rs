//! Topic registry for Fanout.
//!
//! The registry maps topic names to their multicast streams and consumer
//! counts, and is the authority on which topics are currently subscribed at
//! the transport level.
//!
//! Every count transition for a topic happens while holding that topic's
//! map entry, so `ensure` + `increment` and `decrement` + `remove` each run
//! as one critical section. Different topics never contend on the same
//! entry.

use crate::event::InboundEvent;
use crate::topic::{validate_topic_name, Topic, TopicName, TopicStream, DEFAULT_STREAM_CAPACITY};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid topic name.
    #[error("Invalid topic name: {0}")]
    InvalidTopic(&'static str),

    /// Topic not found.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Rejected registry configuration.
    #[error("Invalid registry config: {0}")]
    InvalidConfig(&'static str),

    /// Topic still has live consumers.
    #[error("Topic {topic} still has {consumers} consumer(s)")]
    StillReferenced {
        /// Topic name.
        topic: String,
        /// Live consumer count.
        consumers: usize,
    },
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Multicast stream capacity per topic. Must be non-zero.
    pub stream_capacity: usize,
}

impl RegistryConfig {
    /// Check the configuration before any topic is created.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream capacity is zero.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.stream_capacity == 0 {
            return Err(RegistryError::InvalidConfig(
                "stream_capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

/// A consumer's attachment to a topic, produced by [`TopicRegistry::acquire`].
#[derive(Debug)]
pub struct Attachment {
    /// Topic name.
    pub topic: TopicName,
    /// Incarnation of the topic entry the consumer attached to.
    pub epoch: u64,
    /// View of the topic's multicast stream.
    pub stream: TopicStream,
    /// Whether this attachment created the topic entry.
    pub is_new: bool,
    /// Consumer count after attaching.
    pub consumers: usize,
}

/// Outcome of [`TopicRegistry::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other consumers remain attached.
    Remaining(usize),
    /// The last consumer left and the entry was removed.
    TornDown,
    /// The topic has a live entry from a different incarnation.
    Stale,
    /// The topic has no live entry.
    Unknown,
}

/// The topic registry.
pub struct TopicRegistry {
    /// Topics indexed by name.
    topics: DashMap<TopicName, Topic>,
    /// Source of entry incarnation numbers.
    next_epoch: AtomicU64,
    /// Configuration.
    config: RegistryConfig,
}

impl TopicRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::build(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_config(config: RegistryConfig) -> Result<Self, RegistryError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: RegistryConfig) -> Self {
        debug!("Creating topic registry with config: {:?}", config);
        Self {
            topics: DashMap::new(),
            next_epoch: AtomicU64::new(1),
            config,
        }
    }

    fn create(&self, topic: &str) -> Topic {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        debug!(topic = %topic, epoch, "Creating topic");
        Topic::with_capacity(topic, epoch, self.config.stream_capacity)
    }

    /// Return a view of the topic's stream, creating the entry if needed.
    ///
    /// The boolean is `true` when this call created the entry, in which case
    /// the caller is responsible for the transport-level subscribe.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid.
    pub fn ensure(&self, topic: &str) -> Result<(TopicStream, bool), RegistryError> {
        validate_topic_name(topic).map_err(RegistryError::InvalidTopic)?;

        let (entry, is_new) = match self.topics.entry(topic.to_string()) {
            Entry::Occupied(occupied) => (occupied.into_ref(), false),
            Entry::Vacant(vacant) => (vacant.insert(self.create(topic)), true),
        };

        Ok((entry.stream(), is_new))
    }

    /// Increment a topic's consumer count.
    ///
    /// Returns the new count, or `None` if the topic does not exist.
    pub fn increment(&self, topic: &str) -> Option<usize> {
        match self.topics.get_mut(topic) {
            Some(mut entry) => Some(entry.increment()),
            None => {
                warn!(topic = %topic, "Increment on unknown topic");
                None
            }
        }
    }

    /// Decrement a topic's consumer count, clamped at zero.
    ///
    /// Returns the new count, or `None` if the topic does not exist.
    pub fn decrement(&self, topic: &str) -> Option<usize> {
        match self.topics.get_mut(topic) {
            Some(mut entry) => Some(entry.decrement()),
            None => {
                warn!(topic = %topic, "Decrement on unknown topic");
                None
            }
        }
    }

    /// Remove a topic whose consumer count is zero.
    ///
    /// Dropping the entry ends every outstanding stream view.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic does not exist or still has consumers.
    pub fn remove(&self, topic: &str) -> Result<(), RegistryError> {
        match self.topics.entry(topic.to_string()) {
            Entry::Occupied(occupied) => {
                let consumers = occupied.get().consumer_count();
                if consumers > 0 {
                    return Err(RegistryError::StillReferenced {
                        topic: topic.to_string(),
                        consumers,
                    });
                }
                occupied.remove();
                debug!(topic = %topic, "Removed topic");
                Ok(())
            }
            Entry::Vacant(_) => Err(RegistryError::TopicNotFound(topic.to_string())),
        }
    }

    /// Deliver an event to its topic's stream.
    ///
    /// Returns the number of consumers that received it, or `None` if no
    /// entry exists for the topic. A missing entry is expected when delivery
    /// races teardown; the caller decides how to report the dropped event.
    pub fn dispatch(&self, event: InboundEvent) -> Option<usize> {
        match self.topics.get(event.topic.as_str()) {
            Some(entry) => {
                let count = entry.deliver(Arc::new(event));
                trace!(topic = %entry.name(), recipients = count, "Dispatched event");
                Some(count)
            }
            None => {
                trace!(topic = %event.topic, "No entry for topic");
                None
            }
        }
    }

    /// Attach a consumer to a topic as one atomic step.
    ///
    /// Performs `ensure` and `increment` while holding the topic's entry.
    /// `on_subscribe` runs inside that critical section whenever the topic
    /// is not yet subscribed at the transport level, and reports whether the
    /// transport accepted the request. It must not call back into the
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid.
    pub fn acquire<F>(&self, topic: &str, on_subscribe: F) -> Result<Attachment, RegistryError>
    where
        F: FnOnce(&str) -> bool,
    {
        validate_topic_name(topic).map_err(RegistryError::InvalidTopic)?;

        let (mut entry, is_new) = match self.topics.entry(topic.to_string()) {
            Entry::Occupied(occupied) => (occupied.into_ref(), false),
            Entry::Vacant(vacant) => (vacant.insert(self.create(topic)), true),
        };

        if !entry.is_transport_subscribed() {
            let accepted = on_subscribe(topic);
            entry.set_transport_subscribed(accepted);
        }

        let stream = entry.stream();
        let consumers = entry.increment();

        debug!(topic = %topic, consumers, is_new, "Consumer attached");

        Ok(Attachment {
            topic: topic.to_string(),
            epoch: entry.epoch(),
            stream,
            is_new,
            consumers,
        })
    }

    /// Detach a consumer from a topic as one atomic step.
    ///
    /// Performs `decrement` and, when the count reaches zero, `remove` while
    /// holding the topic's entry. `on_last` runs inside that critical
    /// section before the entry is removed and receives whether the topic
    /// was subscribed at the transport level. It must not call back into the
    /// registry.
    pub fn release<F>(&self, topic: &str, epoch: u64, on_last: F) -> Release
    where
        F: FnOnce(&str, bool),
    {
        let Entry::Occupied(mut occupied) = self.topics.entry(topic.to_string()) else {
            return Release::Unknown;
        };

        if occupied.get().epoch() != epoch {
            return Release::Stale;
        }

        let remaining = occupied.get_mut().decrement();
        if remaining > 0 {
            debug!(topic = %topic, consumers = remaining, "Consumer detached");
            return Release::Remaining(remaining);
        }

        on_last(topic, occupied.get().is_transport_subscribed());
        occupied.remove();
        info!(topic = %topic, "Last consumer left; topic torn down");

        Release::TornDown
    }

    /// Retry the transport subscribe for every topic that lacks one.
    ///
    /// Returns the number of topics the transport accepted.
    pub fn resubscribe_pending<F>(&self, mut on_subscribe: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let mut accepted = 0;
        for mut entry in self.topics.iter_mut() {
            if entry.is_transport_subscribed() {
                continue;
            }
            let topic = entry.key().clone();
            if on_subscribe(&topic) {
                entry.set_transport_subscribed(true);
                accepted += 1;
            }
        }
        accepted
    }

    /// Forget every transport-level subscription, keeping the entries.
    ///
    /// Used when the connection is lost: the consumers stay attached and the
    /// next `resubscribe_pending` subscribes their topics on the new
    /// connection. Returns the number of entries that were subscribed.
    pub fn clear_transport_subscriptions(&self) -> usize {
        let mut cleared = 0;
        for mut entry in self.topics.iter_mut() {
            if entry.is_transport_subscribed() {
                entry.set_transport_subscribed(false);
                cleared += 1;
            }
        }
        debug!(cleared, "Cleared transport subscriptions");
        cleared
    }

    /// Remove every topic regardless of consumer count.
    ///
    /// `on_each` receives the topic name and whether it was subscribed at the
    /// transport level, inside the topic's critical section. Returns the
    /// number of topics removed.
    pub fn drain<F>(&self, mut on_each: F) -> usize
    where
        F: FnMut(&str, bool),
    {
        let mut removed = 0;
        for topic in self.topics() {
            if let Entry::Occupied(occupied) = self.topics.entry(topic) {
                on_each(occupied.key().as_str(), occupied.get().is_transport_subscribed());
                occupied.remove();
                removed += 1;
            }
        }
        debug!(removed, "Drained topic registry");
        removed
    }

    /// Check if a topic exists.
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Get the consumer count for a topic.
    #[must_use]
    pub fn consumer_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|e| e.consumer_count())
            .unwrap_or(0)
    }

    /// Get the current incarnation of a topic entry.
    #[must_use]
    pub fn epoch(&self, topic: &str) -> Option<u64> {
        self.topics.get(topic).map(|e| e.epoch())
    }

    /// Whether the transport accepted a subscribe for a topic.
    #[must_use]
    pub fn is_transport_subscribed(&self, topic: &str) -> bool {
        self.topics
            .get(topic)
            .map(|e| e.is_transport_subscribed())
            .unwrap_or(false)
    }

    /// Get all topic names.
    #[must_use]
    pub fn topics(&self) -> Vec<TopicName> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            topic_count: self.topics.len(),
            consumer_count: self.topics.iter().map(|e| e.consumer_count()).sum(),
        }
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Number of live topics.
    pub topic_count: usize,
    /// Total number of attached consumers.
    pub consumer_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_acquire_creates_once() {
        let registry = TopicRegistry::new();
        let subscribes = AtomicUsize::new(0);
        let on_subscribe = |_: &str| {
            subscribes.fetch_add(1, Ordering::SeqCst);
            true
        };

        let first = registry.acquire("room.1", on_subscribe).unwrap();
        assert!(first.is_new);
        assert_eq!(first.consumers, 1);

        let second = registry.acquire("room.1", on_subscribe).unwrap();
        assert!(!second.is_new);
        assert_eq!(second.consumers, 2);
        assert_eq!(first.epoch, second.epoch);

        assert_eq!(subscribes.load(Ordering::SeqCst), 1);
        assert!(registry.is_transport_subscribed("room.1"));
    }

    #[test]
    fn test_refused_subscribe_is_retried_by_next_acquire() {
        let registry = TopicRegistry::new();

        let _a = registry.acquire("room.1", |_| false).unwrap();
        assert!(registry.contains("room.1"));
        assert!(!registry.is_transport_subscribed("room.1"));

        let mut retried = false;
        let _b = registry
            .acquire("room.1", |_| {
                retried = true;
                true
            })
            .unwrap();
        assert!(retried);
        assert!(registry.is_transport_subscribed("room.1"));
    }

    #[test]
    fn test_release_tears_down_on_last() {
        let registry = TopicRegistry::new();
        let a = registry.acquire("room.1", |_| true).unwrap();
        let b = registry.acquire("room.1", |_| true).unwrap();

        let mut unsubscribed = 0;
        assert_eq!(
            registry.release("room.1", a.epoch, |_, _| unsubscribed += 1),
            Release::Remaining(1)
        );
        assert_eq!(unsubscribed, 0);

        assert_eq!(
            registry.release("room.1", b.epoch, |_, _| unsubscribed += 1),
            Release::TornDown
        );
        assert_eq!(unsubscribed, 1);
        assert!(!registry.contains("room.1"));
    }

    #[test]
    fn test_release_with_stale_epoch() {
        let registry = TopicRegistry::new();
        let old = registry.acquire("room.1", |_| true).unwrap();
        registry.release("room.1", old.epoch, |_, _| {});

        let fresh = registry.acquire("room.1", |_| true).unwrap();
        assert_ne!(old.epoch, fresh.epoch);

        let mut called = false;
        assert_eq!(
            registry.release("room.1", old.epoch, |_, _| called = true),
            Release::Stale
        );
        assert!(!called);
        assert_eq!(registry.consumer_count("room.1"), 1);
        assert_eq!(registry.release("missing", 1, |_, _| {}), Release::Unknown);
    }

    #[tokio::test]
    async fn test_remove_ends_streams() {
        let registry = TopicRegistry::new();
        let (mut stream, is_new) = registry.ensure("room.1").unwrap();
        assert!(is_new);

        let (_, is_new) = registry.ensure("room.1").unwrap();
        assert!(!is_new);

        registry.remove("room.1").unwrap();
        assert!(matches!(
            stream.recv().await,
            Err(tokio::sync::broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn test_remove_requires_zero_consumers() {
        let registry = TopicRegistry::new();
        registry.ensure("room.1").unwrap();
        assert_eq!(registry.increment("room.1"), Some(1));

        assert!(matches!(
            registry.remove("room.1"),
            Err(RegistryError::StillReferenced { consumers: 1, .. })
        ));

        assert_eq!(registry.decrement("room.1"), Some(0));
        assert_eq!(registry.decrement("room.1"), Some(0));
        registry.remove("room.1").unwrap();

        assert!(matches!(
            registry.remove("room.1"),
            Err(RegistryError::TopicNotFound(_))
        ));
        assert_eq!(registry.increment("room.1"), None);
    }

    #[test]
    fn test_dispatch_routes_by_topic() {
        let registry = TopicRegistry::new();
        let mut a = registry.acquire("room.1", |_| true).unwrap();
        let mut b = registry.acquire("room.1", |_| true).unwrap();
        let mut other = registry.acquire("room.2", |_| true).unwrap();

        let count = registry.dispatch(InboundEvent::new("room.1", json!({"text": "hi"})));
        assert_eq!(count, Some(2));

        assert_eq!(a.stream.try_recv().unwrap().payload, json!({"text": "hi"}));
        assert_eq!(b.stream.try_recv().unwrap().payload, json!({"text": "hi"}));
        assert!(other.stream.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_unknown_topic_is_dropped() {
        let registry = TopicRegistry::new();
        assert_eq!(registry.dispatch(InboundEvent::new("nobody", json!(1))), None);

        // Later events still route.
        let mut a = registry.acquire("room.1", |_| true).unwrap();
        assert_eq!(registry.dispatch(InboundEvent::new("room.1", json!(2))), Some(1));
        assert!(a.stream.try_recv().is_ok());
    }

    #[test]
    fn test_invalid_topic() {
        let registry = TopicRegistry::new();
        assert!(matches!(
            registry.acquire("", |_| true),
            Err(RegistryError::InvalidTopic(_))
        ));
        assert!(registry.ensure("a,b").is_err());
    }

    #[test]
    fn test_resubscribe_pending_and_drain() {
        let registry = TopicRegistry::new();
        let _a = registry.acquire("room.1", |_| false).unwrap();
        let _b = registry.acquire("room.2", |_| true).unwrap();

        let mut retried = Vec::new();
        let accepted = registry.resubscribe_pending(|t| {
            retried.push(t.to_string());
            true
        });
        assert_eq!(accepted, 1);
        assert_eq!(retried, vec!["room.1".to_string()]);

        let mut drained = Vec::new();
        assert_eq!(registry.drain(|t, subscribed| drained.push((t.to_string(), subscribed))), 2);
        drained.sort();
        assert_eq!(
            drained,
            vec![("room.1".to_string(), true), ("room.2".to_string(), true)]
        );
        assert_eq!(registry.stats().topic_count, 0);
    }

    #[test]
    fn test_clear_transport_subscriptions_keeps_consumers() {
        let registry = TopicRegistry::new();
        let a = registry.acquire("room.1", |_| true).unwrap();
        let _b = registry.acquire("room.2", |_| false).unwrap();

        assert_eq!(registry.clear_transport_subscriptions(), 1);
        assert!(!registry.is_transport_subscribed("room.1"));
        assert_eq!(registry.consumer_count("room.1"), 1);
        assert_eq!(registry.epoch("room.1"), Some(a.epoch));

        let mut retried = Vec::new();
        let accepted = registry.resubscribe_pending(|t| {
            retried.push(t.to_string());
            true
        });
        retried.sort();
        assert_eq!(accepted, 2);
        assert_eq!(retried, vec!["room.1".to_string(), "room.2".to_string()]);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let result = TopicRegistry::with_config(RegistryConfig { stream_capacity: 0 });
        assert!(matches!(result, Err(RegistryError::InvalidConfig(_))));
        assert!(TopicRegistry::with_config(RegistryConfig { stream_capacity: 1 }).is_ok());
    }

    #[test]
    fn test_registry_stats() {
        let registry = TopicRegistry::new();
        let _a = registry.acquire("room.1", |_| true).unwrap();
        let _b = registry.acquire("room.1", |_| true).unwrap();
        let _c = registry.acquire("room.2", |_| true).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.consumer_count, 3);
    }
}
