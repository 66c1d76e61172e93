//! The multiplexer.
//!
//! Drives the [`TopicRegistry`] and a [`Transport`] together. Transport
//! subscribe and unsubscribe requests are issued from inside the registry's
//! per-topic critical section, so for any topic they alternate strictly and
//! a subscriber racing teardown always finds either the old entry or a fresh
//! one that it subscribes itself.

use fanout_core::{validate_topic_name, RegistryStats, Release, TopicRegistry};
use fanout_transport::{EventHandler, PublishAck, Transport, TransportEvent};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::binding::Subscription;
use crate::error::{MuxError, SubscriptionWarning};
use crate::metrics;

/// Shares one transport connection across any number of topic consumers.
///
/// Cloning is cheap; every clone drives the same registry and transport.
#[derive(Clone)]
pub struct Multiplexer {
    transport: Arc<dyn Transport>,
    registry: Arc<TopicRegistry>,
}

impl Multiplexer {
    /// Create a multiplexer over a transport and a registry.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<TopicRegistry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Attach a new consumer to a topic.
    ///
    /// The first consumer of a topic triggers exactly one transport-level
    /// subscribe. A refused subscribe keeps the local entry and is retried
    /// by the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid.
    pub fn subscribe(&self, topic: &str) -> Result<Subscription, MuxError> {
        let transport = self.transport.as_ref();
        let attachment = self
            .registry
            .acquire(topic, |topic| request_subscribe(transport, topic))?;
        metrics::record_registry(self.registry.stats());

        Ok(Subscription::new(self.clone(), attachment))
    }

    /// Release a consumer's subscription.
    ///
    /// Returns `false` if it was already released.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        subscription.unsubscribe()
    }

    /// Publish a payload to a topic.
    ///
    /// Publishing does not require a local subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid, the transport is not
    /// connected, or the remote side rejects the payload.
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<PublishAck, MuxError> {
        validate_topic_name(topic).map_err(MuxError::InvalidTopic)?;
        if !self.transport.is_connected() {
            SubscriptionWarning::NotConnected("publish").emit();
        }

        let result = self.transport.publish(topic, payload).await;
        metrics::record_publish(result.is_ok());
        Ok(result?)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Detach one consumer from a topic incarnation.
    ///
    /// Returns the warning emitted, if any.
    pub(crate) fn release(&self, topic: &str, epoch: u64) -> Option<SubscriptionWarning> {
        let transport = self.transport.as_ref();
        let mut refused = None;
        let outcome = self.registry.release(topic, epoch, |topic, subscribed| {
            refused = request_unsubscribe(transport, topic, subscribed);
        });

        let warning = match outcome {
            Release::Remaining(_) | Release::TornDown => {
                metrics::record_registry(self.registry.stats());
                refused
            }
            Release::Stale => Some(SubscriptionWarning::StaleRelease(topic.to_string())),
            Release::Unknown => Some(SubscriptionWarning::UnknownTopic(topic.to_string())),
        };

        if let Some(warning) = &warning {
            warning.clone().emit();
        }
        warning
    }

    /// Retry the transport subscribe for topics that lack one.
    pub(crate) fn resubscribe_pending(&self) -> usize {
        let transport = self.transport.as_ref();
        self.registry
            .resubscribe_pending(|topic| request_subscribe(transport, topic))
    }

    /// Remove every topic, unsubscribing those the transport accepted.
    pub(crate) fn drain(&self) -> usize {
        let transport = self.transport.as_ref();
        let mut warnings = Vec::new();
        let drained = self.registry.drain(|topic, subscribed| {
            warnings.extend(request_unsubscribe(transport, topic, subscribed));
        });
        for warning in &warnings {
            warning.clone().emit();
        }
        metrics::record_registry(self.registry.stats());
        drained
    }

    /// Build the inbound handler to register with the transport.
    ///
    /// The handler holds only the registry, so the transport never keeps
    /// itself alive through it.
    #[must_use]
    pub fn event_handler(&self) -> EventHandler {
        let registry = Arc::clone(&self.registry);
        Arc::new(move |event| route(&registry, event))
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("transport", &self.transport.name())
            .field("stats", &self.registry.stats())
            .finish()
    }
}

/// Ask the transport to deliver a topic. Runs inside the topic's critical
/// section.
fn request_subscribe(transport: &dyn Transport, topic: &str) -> bool {
    if !transport.is_connected() {
        SubscriptionWarning::NotConnected("subscribe").emit();
        return false;
    }

    match transport.send_subscribe(topic) {
        Ok(()) => {
            metrics::record_transport_subscribe();
            info!(topic = %topic, transport = transport.name(), "Subscribed");
            true
        }
        Err(e) => {
            SubscriptionWarning::TransportRefused(topic.to_string(), e.to_string()).emit();
            false
        }
    }
}

/// Ask the transport to stop delivering a topic. Runs inside the topic's
/// critical section, so the warning is returned for the caller to emit.
///
/// Nothing is sent for a topic the transport never accepted.
fn request_unsubscribe(
    transport: &dyn Transport,
    topic: &str,
    subscribed: bool,
) -> Option<SubscriptionWarning> {
    if !transport.is_connected() {
        return Some(SubscriptionWarning::NotConnected("unsubscribe"));
    }
    if !subscribed {
        return None;
    }

    match transport.send_unsubscribe(topic) {
        Ok(()) => {
            metrics::record_transport_unsubscribe();
            info!(topic = %topic, transport = transport.name(), "Unsubscribed");
            None
        }
        Err(e) => Some(SubscriptionWarning::TransportRefused(
            topic.to_string(),
            e.to_string(),
        )),
    }
}

fn route(registry: &TopicRegistry, event: TransportEvent) {
    match event {
        TransportEvent::Message(event) => {
            let topic = event.topic.clone();
            match registry.dispatch(event) {
                Some(recipients) => {
                    metrics::record_dispatched();
                    debug!(topic = %topic, recipients, "Routed inbound event");
                }
                None => {
                    metrics::record_dropped();
                    SubscriptionWarning::DroppedEvent(topic).emit();
                }
            }
        }
        TransportEvent::Error(reason) => warn!(error = %reason, "Transport reported an error"),
        TransportEvent::Closed => {
            let orphaned = registry.clear_transport_subscriptions();
            warn!(orphaned, "Transport connection closed; topics wait for the next start");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::InboundEvent;
    use fanout_transport::{Command, Identity, LoopbackTransport, PublishError};
    use serde_json::json;

    async fn connected() -> (Arc<LoopbackTransport>, Multiplexer) {
        let transport = Arc::new(LoopbackTransport::new());
        let mux = Multiplexer::new(transport.clone(), Arc::new(TopicRegistry::new()));
        transport.on_event(mux.event_handler()).unwrap();
        transport.connect(&Identity::new("user-1")).await.unwrap();
        (transport, mux)
    }

    #[tokio::test]
    async fn test_two_consumers_one_subscribe_one_unsubscribe() {
        let (transport, mux) = connected().await;

        let a = mux.subscribe("room.1").unwrap();
        let b = mux.subscribe("room.1").unwrap();
        assert_eq!(transport.subscribe_count("room.1"), 1);
        assert_eq!(mux.registry().consumer_count("room.1"), 2);

        assert!(mux.unsubscribe(&a));
        assert_eq!(transport.unsubscribe_count("room.1"), 0);

        assert!(mux.unsubscribe(&b));
        assert_eq!(
            transport.commands(),
            vec![
                Command::Subscribe("room.1".into()),
                Command::Unsubscribe("room.1".into())
            ]
        );
        assert!(!mux.registry().contains("room.1"));
    }

    #[tokio::test]
    async fn test_double_unsubscribe_is_noop() {
        let (transport, mux) = connected().await;

        let a = mux.subscribe("room.1").unwrap();
        let _b = mux.subscribe("room.1").unwrap();

        assert!(mux.unsubscribe(&a));
        assert!(!mux.unsubscribe(&a));
        assert_eq!(mux.registry().consumer_count("room.1"), 1);
        assert_eq!(transport.unsubscribe_count("room.1"), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_after_teardown() {
        let (transport, mux) = connected().await;

        let first = mux.subscribe("room.1").unwrap();
        drop(first);
        let _second = mux.subscribe("room.1").unwrap();

        assert_eq!(transport.subscribe_count("room.1"), 2);
        assert_eq!(transport.unsubscribe_count("room.1"), 1);
        assert!(transport.is_delivering("room.1"));
    }

    #[tokio::test]
    async fn test_publish_is_independent_of_subscriptions() {
        let (transport, mux) = connected().await;

        let ack = mux.publish("room.1", json!({"text": "hi"})).await.unwrap();
        assert!(ack.timetoken.is_some());
        assert!(!mux.registry().contains("room.1"));
        assert_eq!(transport.subscribe_count("room.1"), 0);

        transport.set_reject_publish(true);
        assert!(matches!(
            mux.publish("room.1", json!(1)).await,
            Err(MuxError::Publish(PublishError::Rejected(_)))
        ));
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let transport = Arc::new(LoopbackTransport::new());
        let mux = Multiplexer::new(transport, Arc::new(TopicRegistry::new()));

        assert!(matches!(
            mux.publish("room.1", json!(1)).await,
            Err(MuxError::Publish(PublishError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_invalid_topics_never_reach_transport() {
        let (transport, mux) = connected().await;

        assert!(matches!(mux.subscribe(""), Err(MuxError::InvalidTopic(_))));
        assert!(matches!(
            mux.publish("a,b", json!(1)).await,
            Err(MuxError::InvalidTopic(_))
        ));
        assert!(transport.commands().is_empty());
    }

    #[tokio::test]
    async fn test_refused_subscribe_keeps_entry_and_retries() {
        let (transport, mux) = connected().await;

        transport.set_refuse_subscribe(true);
        let _a = mux.subscribe("room.1").unwrap();
        assert!(mux.registry().contains("room.1"));
        assert!(!mux.registry().is_transport_subscribed("room.1"));

        // Messages that still arrive are delivered.
        transport.inject(InboundEvent::new("room.1", json!(1)));

        transport.set_refuse_subscribe(false);
        let _b = mux.subscribe("room.1").unwrap();
        assert!(mux.registry().is_transport_subscribed("room.1"));
        assert_eq!(transport.subscribe_count("room.1"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_before_connect_warns() {
        let transport = Arc::new(LoopbackTransport::new());
        let mux = Multiplexer::new(transport.clone(), Arc::new(TopicRegistry::new()));

        let sub = mux.subscribe("room.1").unwrap();
        assert!(!mux.registry().is_transport_subscribed("room.1"));

        assert_eq!(
            mux.release(sub.topic(), sub.epoch()),
            Some(SubscriptionWarning::NotConnected("unsubscribe"))
        );
        assert!(!mux.registry().contains("room.1"));
        assert!(transport.commands().is_empty());
    }

    #[tokio::test]
    async fn test_release_classifies_stale_and_unknown() {
        let (_transport, mux) = connected().await;

        let old = mux.subscribe("room.1").unwrap();
        let epoch = old.epoch();
        drop(old);
        assert_eq!(
            mux.release("room.1", epoch),
            Some(SubscriptionWarning::UnknownTopic("room.1".into()))
        );

        let _fresh = mux.subscribe("room.1").unwrap();
        assert_eq!(
            mux.release("room.1", epoch),
            Some(SubscriptionWarning::StaleRelease("room.1".into()))
        );
        assert_eq!(mux.registry().consumer_count("room.1"), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_clears_transport_subscriptions() {
        let (transport, mux) = connected().await;
        let _sub = mux.subscribe("room.1").unwrap();
        assert!(mux.registry().is_transport_subscribed("room.1"));

        transport.close();

        assert!(mux.registry().contains("room.1"));
        assert!(!mux.registry().is_transport_subscribed("room.1"));
    }

    #[tokio::test]
    async fn test_dropped_event_does_not_stop_delivery() {
        let (transport, mux) = connected().await;
        let mut sub = mux.subscribe("room.1").unwrap();

        transport.inject(InboundEvent::new("ghost", json!("lost")));
        transport.inject(InboundEvent::new("room.1", json!("kept")));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload, json!("kept"));
    }
}
